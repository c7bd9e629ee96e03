//! Periodic export of durability statistics into the metrics registry.

use crate::metrics::Metrics;
use mmjournal_core::Durability;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Copies `Durability::stats()` into [`Metrics`] on a fixed interval.
pub struct StatsExporter {
    durability: Arc<Durability>,
    metrics: Arc<Metrics>,
    interval: Duration,
    exports: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

impl StatsExporter {
    pub fn new(durability: Arc<Durability>, metrics: Arc<Metrics>, interval: Duration) -> Self {
        Self {
            durability,
            metrics,
            interval,
            exports: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Takes one snapshot and folds it into the metrics.
    pub fn export_once(&self) {
        let status = self.durability.stats();
        self.metrics.update(&status);
        self.exports.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs the export loop (call from a background task).
    pub async fn run(&self) {
        tracing::info!(
            "Stats exporter started (interval={}ms)",
            self.interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.export_once();
        }

        tracing::info!(
            "Stats exporter stopped after {} exports",
            self.exports.load(Ordering::Relaxed)
        );
    }

    /// Signals the exporter to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Number of snapshots exported so far.
    pub fn exports(&self) -> u64 {
        self.exports.load(Ordering::Relaxed)
    }
}
