//! # mmjournal-server
//!
//! Process layer for mmjournal.
//!
//! This crate provides:
//! - YAML configuration with environment overrides
//! - Prometheus metrics and an HTTP endpoint serving them
//! - A background task exporting durability statistics

pub mod config;
pub mod error;
pub mod exporter;
pub mod metrics;

pub use config::{
    CommitConfig, Config, ConfigError, JournalSettings, MetricsConfig, RemapConfig, StorageConfig,
};
pub use error::ServerError;
pub use exporter::StatsExporter;
pub use metrics::{run_metrics_server, Metrics};
