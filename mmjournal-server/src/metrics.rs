//! Prometheus metrics for the durability engine.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server exposing `/metrics`, `/status` (JSON) and `/health`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mmjournal_core::DurabilityStatus;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Commit phase duration buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Prometheus metrics for one durability context.
pub struct Metrics {
    registry: Registry,
    /// Group commits that journaled a section.
    pub commits_total: IntCounter,
    /// Commits run while the exclusive lock was held.
    pub commits_in_write_lock_total: IntCounter,
    /// Commits forced from a foreground thread.
    pub early_commits_total: IntCounter,
    /// Bytes by destination (`journal`, `uncompressed`, `data_files`).
    pub bytes_total: IntCounterVec,
    /// Journal fsyncs.
    pub journal_fsyncs_total: IntCounter,
    /// Journal file rotations.
    pub journal_rotations_total: IntCounter,
    /// Journal files deleted after their sections reached the data files.
    pub journal_files_removed_total: IntCounter,
    /// Bytes declared but not yet committed.
    pub uncommitted_bytes: IntGauge,
    /// Write intents not yet committed.
    pub pending_intents: IntGauge,
    /// Bytes written through private views since the last full remap.
    pub private_map_bytes: IntGauge,
    /// Open data files.
    pub open_files: IntGauge,
    /// Mean commit duration over the last statistics interval.
    pub commit_duration: Histogram,
    status_json: Mutex<String>,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let commits_total = IntCounter::with_opts(Opts::new(
            "mmjournal_commits_total",
            "Group commits that journaled a section",
        ))?;
        registry.register(Box::new(commits_total.clone()))?;

        let commits_in_write_lock_total = IntCounter::with_opts(Opts::new(
            "mmjournal_commits_in_write_lock_total",
            "Group commits run under the exclusive lock",
        ))?;
        registry.register(Box::new(commits_in_write_lock_total.clone()))?;

        let early_commits_total = IntCounter::with_opts(Opts::new(
            "mmjournal_early_commits_total",
            "Group commits forced from a foreground thread",
        ))?;
        registry.register(Box::new(early_commits_total.clone()))?;

        let bytes_total = IntCounterVec::new(
            Opts::new("mmjournal_bytes_total", "Bytes committed by destination"),
            &["destination"],
        )?;
        registry.register(Box::new(bytes_total.clone()))?;

        // Journal
        let journal_fsyncs_total = IntCounter::with_opts(Opts::new(
            "mmjournal_journal_fsyncs_total",
            "Forced syncs of the journal",
        ))?;
        registry.register(Box::new(journal_fsyncs_total.clone()))?;

        let journal_rotations_total = IntCounter::with_opts(Opts::new(
            "mmjournal_journal_rotations_total",
            "Journal file rotations",
        ))?;
        registry.register(Box::new(journal_rotations_total.clone()))?;

        let journal_files_removed_total = IntCounter::with_opts(Opts::new(
            "mmjournal_journal_files_removed_total",
            "Journal files removed after a data sync",
        ))?;
        registry.register(Box::new(journal_files_removed_total.clone()))?;

        // Ledger and views
        let uncommitted_bytes = IntGauge::with_opts(Opts::new(
            "mmjournal_uncommitted_bytes",
            "Bytes declared but not yet committed",
        ))?;
        registry.register(Box::new(uncommitted_bytes.clone()))?;

        let pending_intents = IntGauge::with_opts(Opts::new(
            "mmjournal_pending_intents",
            "Write intents not yet committed",
        ))?;
        registry.register(Box::new(pending_intents.clone()))?;

        let private_map_bytes = IntGauge::with_opts(Opts::new(
            "mmjournal_private_map_bytes",
            "Bytes written through private views since the last full remap",
        ))?;
        registry.register(Box::new(private_map_bytes.clone()))?;

        let open_files = IntGauge::with_opts(Opts::new(
            "mmjournal_open_files",
            "Open data files",
        ))?;
        registry.register(Box::new(open_files.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mmjournal_commit_duration_seconds",
                "Mean group commit duration per statistics interval",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            registry,
            commits_total,
            commits_in_write_lock_total,
            early_commits_total,
            bytes_total,
            journal_fsyncs_total,
            journal_rotations_total,
            journal_files_removed_total,
            uncommitted_bytes,
            pending_intents,
            private_map_bytes,
            open_files,
            commit_duration,
            status_json: Mutex::new(String::from("{}")),
        })
    }

    /// Folds a status snapshot into the metrics.
    ///
    /// Counters follow the engine's cumulative totals, so calling this twice
    /// with the same snapshot changes nothing.
    pub fn update(&self, status: &DurabilityStatus) {
        let totals = &status.stats.totals;
        advance(&self.commits_total, totals.commits);
        advance(&self.commits_in_write_lock_total, totals.commits_in_write_lock);
        advance(&self.early_commits_total, totals.early_commits);
        advance(
            &self.bytes_total.with_label_values(&["journal"]),
            totals.journaled_bytes,
        );
        advance(
            &self.bytes_total.with_label_values(&["uncompressed"]),
            totals.uncompressed_bytes,
        );
        advance(
            &self.bytes_total.with_label_values(&["data_files"]),
            totals.data_file_bytes,
        );

        if let Some(journal) = &status.journal {
            advance(&self.journal_fsyncs_total, journal.fsyncs);
            advance(&self.journal_rotations_total, journal.rotations);
            advance(&self.journal_files_removed_total, journal.files_removed);
        }

        self.uncommitted_bytes.set(clamp(status.uncommitted_bytes));
        self.pending_intents.set(clamp(status.pending_intents as u64));
        self.private_map_bytes.set(clamp(status.private_map_bytes));
        self.open_files.set(clamp(status.open_files as u64));

        let last = &status.stats.last_interval;
        if last.commits > 0 {
            let micros = last.prep_micros + last.journal_micros + last.data_files_micros;
            let mean = micros as f64 / last.commits as f64 / 1_000_000.0;
            self.commit_duration.observe(mean);
        }

        match serde_json::to_string(status) {
            Ok(json) => *self.status_json.lock() = json,
            Err(e) => tracing::warn!("Failed to encode durability status: {}", e),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// The last exported status as JSON.
    pub fn status_json(&self) -> String {
        self.status_json.lock().clone()
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        "/status" => respond(StatusCode::OK, "application/json", metrics.status_json()),
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmjournal_core::{IntervalStats, StatsSnapshot};

    fn status(commits: u64, journaled: u64) -> DurabilityStatus {
        let totals = IntervalStats {
            commits,
            journaled_bytes: journaled,
            data_file_bytes: journaled * 2,
            ..IntervalStats::default()
        };
        let last_interval = IntervalStats {
            commits: 1,
            prep_micros: 50,
            journal_micros: 400,
            data_files_micros: 50,
            ..IntervalStats::default()
        };
        DurabilityStatus {
            stats: StatsSnapshot {
                last_interval,
                totals,
            },
            journal: None,
            uncommitted_bytes: 4096,
            pending_intents: 3,
            private_map_bytes: 8192,
            open_files: 2,
            commit_interval_millis: 100,
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.update(&status(1, 10));

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("mmjournal_commits_total"));
        assert!(encoded.contains("mmjournal_bytes_total"));
        assert!(encoded.contains("mmjournal_uncommitted_bytes"));
        assert!(encoded.contains("mmjournal_commit_duration_seconds"));
    }

    #[test]
    fn test_update_tracks_totals() {
        let metrics = Metrics::new().unwrap();
        metrics.update(&status(5, 100));
        metrics.update(&status(5, 100));
        assert_eq!(metrics.commits_total.get(), 5);

        metrics.update(&status(8, 150));
        assert_eq!(metrics.commits_total.get(), 8);
        assert_eq!(
            metrics.bytes_total.with_label_values(&["journal"]).get(),
            150
        );
        assert_eq!(
            metrics.bytes_total.with_label_values(&["data_files"]).get(),
            300
        );
        assert_eq!(metrics.open_files.get(), 2);
        assert_eq!(metrics.pending_intents.get(), 3);
    }

    #[test]
    fn test_status_json() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.status_json(), "{}");
        metrics.update(&status(2, 20));

        let json: serde_json::Value = serde_json::from_str(&metrics.status_json()).unwrap();
        assert_eq!(json["uncommitted_bytes"], 4096);
        assert_eq!(json["totals"]["commits"], 2);
    }

    #[test]
    fn test_routes() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(route("/metrics", &metrics).status(), StatusCode::OK);
        assert_eq!(route("/status", &metrics).status(), StatusCode::OK);
        assert_eq!(route("/healthz", &metrics).status(), StatusCode::OK);
        assert_eq!(route("/nope", &metrics).status(), StatusCode::NOT_FOUND);
    }
}
