//! Process configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MMJOURNAL_CONFIG)
//! 3. Environment variables

use mmjournal_core::DurabilityConfig;
use mmjournal_storage::{RemapPolicy, ViewBackend};
use mmjournal_wal::{JournalConfig, DEFAULT_COMPRESSION_LEVEL};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "MMJOURNAL_CONFIG";

const MIB: u64 = 1024 * 1024;

/// Process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data file configuration.
    pub storage: StorageConfig,
    /// Journal configuration.
    pub journal: JournalSettings,
    /// Group commit configuration.
    pub commit: CommitConfig,
    /// Private view remapping.
    pub remap: RemapConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.storage.apply_env_overrides();
        self.journal.apply_env_overrides();
        self.commit.apply_env_overrides();
        self.remap.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Rejects values the durability engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.journal.max_file_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "journal.max_file_size_mb must be positive".to_string(),
            ));
        }
        if let Some(level) = self.journal.compression_level {
            if !(-7..=22).contains(&level) {
                return Err(ConfigError::ValidationError(format!(
                    "journal.compression_level {} is outside -7..=22",
                    level
                )));
            }
        }
        if self.commit.uncommitted_bytes_limit_mb == 0 {
            return Err(ConfigError::ValidationError(
                "commit.uncommitted_bytes_limit_mb must be positive".to_string(),
            ));
        }
        if self.commit.max_intents == 0 {
            return Err(ConfigError::ValidationError(
                "commit.max_intents must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the durability engine's configuration.
    pub fn to_durability_config(&self) -> DurabilityConfig {
        let journal = JournalConfig::new(self.journal_dir())
            .with_max_file_size(self.journal.max_file_size())
            .with_compression(self.journal.compression_level)
            .with_preallocate(self.journal.preallocate);

        let mut config = DurabilityConfig::new(&self.storage.data_dir)
            .with_journal(journal)
            .with_uncommitted_bytes_limit(self.commit.uncommitted_bytes_limit())
            .with_max_intents(self.commit.max_intents)
            .with_remap_every_n_commits(self.remap.every_n_commits)
            .with_view_backend(self.storage.view_backend)
            .with_paranoid(self.storage.paranoid)
            .with_data_sync_interval(self.storage.data_sync_interval())
            .with_stats_interval(self.commit.stats_interval())
            .with_upgrade_timeout(self.commit.upgrade_timeout());

        if let Some(interval) = self.commit.interval() {
            config = config.with_commit_interval(interval);
        }

        let remap = RemapPolicy {
            full_cycle: self.remap.full_cycle(),
            always_remap: self.remap.always_remap,
            private_bytes_limit: config.uncommitted_bytes_limit,
        };
        config.with_remap_policy(remap)
    }

    /// The journal directory, defaulting to `journal` under the data directory.
    pub fn journal_dir(&self) -> PathBuf {
        match &self.journal.dir {
            Some(dir) => dir.clone(),
            None => self.storage.data_dir.join("journal"),
        }
    }
}

/// Data file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
    /// How data files are viewed in memory.
    pub view_backend: ViewBackend,
    /// Compare private and shared views after every locked commit.
    pub paranoid: bool,
    /// Seconds between data file flushes (and journal file removal).
    pub data_sync_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            view_backend: ViewBackend::Mmap,
            paranoid: false,
            data_sync_interval_secs: 60,
        }
    }
}

impl StorageConfig {
    /// Applies a backend name, keeping the current one if it does not parse.
    fn set_view_backend(&mut self, value: &str) {
        match value.parse::<ViewBackend>() {
            Ok(backend) => self.view_backend = backend,
            Err(e) => tracing::warn!("Ignoring MMJOURNAL_VIEW_BACKEND: {}", e),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("MMJOURNAL_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(backend) = std::env::var("MMJOURNAL_VIEW_BACKEND") {
            self.set_view_backend(&backend);
        }

        if let Ok(paranoid) = std::env::var("MMJOURNAL_PARANOID") {
            self.paranoid = parse_flag(&paranoid);
        }

        if let Ok(interval) = std::env::var("MMJOURNAL_DATA_SYNC_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.data_sync_interval_secs = secs;
            }
        }
    }

    pub fn data_sync_interval(&self) -> Duration {
        Duration::from_secs(self.data_sync_interval_secs)
    }
}

/// Journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// Journal directory; `None` keeps it under the data directory.
    pub dir: Option<PathBuf>,
    /// Journal file size in megabytes before rotation.
    pub max_file_size_mb: u64,
    /// zstd level for section bodies (null stores them raw).
    pub compression_level: Option<i32>,
    /// Zero-fill new journal files to their full size.
    pub preallocate: bool,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_file_size_mb: 1024,
            compression_level: Some(DEFAULT_COMPRESSION_LEVEL),
            preallocate: false,
        }
    }
}

impl JournalSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("MMJOURNAL_JOURNAL_DIR") {
            self.dir = Some(PathBuf::from(dir));
        }

        if let Ok(size) = std::env::var("MMJOURNAL_JOURNAL_FILE_SIZE_MB") {
            if let Ok(mb) = size.parse() {
                self.max_file_size_mb = mb;
            }
        }

        if let Ok(level) = std::env::var("MMJOURNAL_COMPRESSION") {
            self.compression_level = match level.to_lowercase().as_str() {
                "off" | "none" | "" => None,
                s => s.parse().ok().or(self.compression_level),
            };
        }

        if let Ok(prealloc) = std::env::var("MMJOURNAL_JOURNAL_PREALLOCATE") {
            self.preallocate = parse_flag(&prealloc);
        }
    }

    /// Returns the journal file size limit in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * MIB
    }
}

/// Group commit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Background commit interval in milliseconds (0 = pick from disk layout).
    pub interval_ms: u64,
    /// Declared megabytes that force an early commit.
    pub uncommitted_bytes_limit_mb: u64,
    /// Pending intents that force an early commit.
    pub max_intents: usize,
    /// Milliseconds an intent writer waits to upgrade for a commit.
    pub upgrade_timeout_ms: u64,
    /// Seconds per statistics interval.
    pub stats_interval_secs: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 0,
            uncommitted_bytes_limit_mb: 100,
            max_intents: mmjournal_core::config::DEFAULT_MAX_INTENTS,
            upgrade_timeout_ms: 100,
            stats_interval_secs: 3,
        }
    }
}

impl CommitConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("MMJOURNAL_COMMIT_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.interval_ms = ms;
            }
        }

        if let Ok(limit) = std::env::var("MMJOURNAL_UNCOMMITTED_LIMIT_MB") {
            if let Ok(mb) = limit.parse() {
                self.uncommitted_bytes_limit_mb = mb;
            }
        }

        if let Ok(max) = std::env::var("MMJOURNAL_MAX_INTENTS") {
            if let Ok(n) = max.parse() {
                self.max_intents = n;
            }
        }

        if let Ok(timeout) = std::env::var("MMJOURNAL_UPGRADE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.upgrade_timeout_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("MMJOURNAL_STATS_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.stats_interval_secs = secs;
            }
        }
    }

    /// The configured interval, `None` when it is chosen automatically.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }

    pub fn uncommitted_bytes_limit(&self) -> u64 {
        self.uncommitted_bytes_limit_mb * MIB
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Private view remapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapConfig {
    /// Milliseconds for one full cycle through the open files.
    pub full_cycle_ms: u64,
    /// Remap every file on every background commit.
    pub always_remap: bool,
    /// Every Nth background commit takes the exclusive lock (0 = never).
    pub every_n_commits: u32,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            full_cycle_ms: 2000,
            always_remap: false,
            every_n_commits: 10,
        }
    }
}

impl RemapConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(cycle) = std::env::var("MMJOURNAL_REMAP_CYCLE_MS") {
            if let Ok(ms) = cycle.parse() {
                self.full_cycle_ms = ms;
            }
        }

        if let Ok(always) = std::env::var("MMJOURNAL_ALWAYS_REMAP") {
            self.always_remap = parse_flag(&always);
        }

        if let Ok(every) = std::env::var("MMJOURNAL_REMAP_EVERY") {
            if let Ok(n) = every.parse() {
                self.every_n_commits = n;
            }
        }
    }

    pub fn full_cycle(&self) -> Duration {
        Duration::from_millis(self.full_cycle_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Milliseconds between stats exports.
    pub refresh_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            refresh_ms: 1000,
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("MMJOURNAL_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("MMJOURNAL_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.max(1))
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
