//! mmjournal - write-ahead durability daemon
//!
//! Recovers the journal, runs the group commit thread, serves metrics, and
//! flushes and truncates the journal on Ctrl-C.

use mmjournal_core::Durability;
use mmjournal_server::{
    config::CONFIG_ENV, run_metrics_server, Config, Metrics, ServerError, StatsExporter,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        if e.needs_operator() {
            tracing::error!("Manual intervention required: inspect the journal with mmjournal-cli");
            std::process::exit(100);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    // Load configuration (from file if MMJOURNAL_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var(CONFIG_ENV) {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var(CONFIG_ENV).is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting mmjournal");
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());
    tracing::info!("  Journal directory: {}", config.journal_dir().display());
    tracing::info!("  View backend: {:?}", config.storage.view_backend);

    std::fs::create_dir_all(&config.storage.data_dir)?;

    let durability = Arc::new(Durability::open(config.to_durability_config())?);
    let outcome = durability.startup()?;
    tracing::info!(
        "  Recovery: {} sections replayed ({} bytes), {} files touched",
        outcome.report.valid_sections,
        outcome.applied.bytes,
        outcome.files.files_touched
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics = Arc::new(Metrics::new()?);
    let exporter = Arc::new(StatsExporter::new(
        Arc::clone(&durability),
        Arc::clone(&metrics),
        config.metrics.refresh_interval(),
    ));

    let exporter_handle = {
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move { exporter.run().await })
    };

    let metrics_handle = if config.metrics.enabled {
        let addr = config.metrics.bind_addr;
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");

    exporter.shutdown();
    let _ = shutdown_tx.send(());
    let _ = exporter_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let closing = Arc::clone(&durability);
    tokio::task::spawn_blocking(move || closing.shutdown())
        .await
        .map_err(std::io::Error::other)??;

    let status = durability.stats();
    tracing::info!(
        "Stopped after {} commits ({} bytes journaled)",
        status.stats.totals.commits,
        status.stats.totals.journaled_bytes
    );
    Ok(())
}
