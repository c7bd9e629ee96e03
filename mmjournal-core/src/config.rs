//! Durability configuration.

use crate::stats::DEFAULT_STATS_INTERVAL;
use mmjournal_storage::{RemapPolicy, ViewBackend};
use mmjournal_wal::JournalConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default uncommitted bytes that force an early commit (100 MiB).
pub const DEFAULT_UNCOMMITTED_BYTES_LIMIT: u64 = 100 * 1024 * 1024;

/// Default ceiling on pending intents before an early commit.
pub const DEFAULT_MAX_INTENTS: usize = 1_000_000;

/// Background commit interval when journal and data share a device.
pub const SAME_DEVICE_COMMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Background commit interval when they do not.
pub const SEPARATE_DEVICE_COMMIT_INTERVAL: Duration = Duration::from_millis(30);

/// Configuration of a durability context.
#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    /// Directory holding the data files.
    pub data_dir: PathBuf,
    pub journal: JournalConfig,
    /// Background commit interval; `None` picks one from the disk layout.
    pub commit_interval: Option<Duration>,
    /// Declared bytes that force a commit from the declaring thread.
    pub uncommitted_bytes_limit: u64,
    /// Pending intents that force a commit from the declaring thread.
    pub max_intents: usize,
    pub remap: RemapPolicy,
    /// Every Nth background commit takes the exclusive lock and remaps.
    pub remap_every_n_commits: u32,
    pub view_backend: ViewBackend,
    /// Compare every private view with its shared view after locked commits.
    pub paranoid: bool,
    /// How often shared views are flushed and old journal files removed.
    pub data_sync_interval: Duration,
    pub stats_interval: Duration,
    /// How long an intent-write holder waits to upgrade for a commit.
    pub upgrade_timeout: Duration,
}

impl DurabilityConfig {
    /// Creates a config with the journal in `data_dir/journal`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let journal = JournalConfig::new(data_dir.join("journal"));
        Self {
            data_dir,
            journal,
            commit_interval: None,
            uncommitted_bytes_limit: DEFAULT_UNCOMMITTED_BYTES_LIMIT,
            max_intents: DEFAULT_MAX_INTENTS,
            remap: RemapPolicy::default(),
            remap_every_n_commits: 10,
            view_backend: ViewBackend::default(),
            paranoid: false,
            data_sync_interval: Duration::from_secs(60),
            stats_interval: DEFAULT_STATS_INTERVAL,
            upgrade_timeout: Duration::from_millis(100),
        }
    }

    pub fn with_journal(mut self, journal: JournalConfig) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = Some(interval);
        self
    }

    /// Sets the early-commit threshold, which is also the private view
    /// growth that triggers a full remap pass.
    pub fn with_uncommitted_bytes_limit(mut self, limit: u64) -> Self {
        self.uncommitted_bytes_limit = limit;
        self.remap.private_bytes_limit = limit;
        self
    }

    pub fn with_max_intents(mut self, max: usize) -> Self {
        self.max_intents = max;
        self
    }

    pub fn with_remap_policy(mut self, remap: RemapPolicy) -> Self {
        self.remap = remap;
        self
    }

    pub fn with_remap_every_n_commits(mut self, n: u32) -> Self {
        self.remap_every_n_commits = n;
        self
    }

    pub fn with_view_backend(mut self, backend: ViewBackend) -> Self {
        self.view_backend = backend;
        self
    }

    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    pub fn with_data_sync_interval(mut self, interval: Duration) -> Self {
        self.data_sync_interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout = timeout;
        self
    }

    /// The configured commit interval, or one chosen from whether the
    /// journal and the data files live on the same device.
    pub fn effective_commit_interval(&self) -> Duration {
        if let Some(interval) = self.commit_interval {
            return interval;
        }
        match same_device(&self.journal.dir, &self.data_dir) {
            Some(false) => SEPARATE_DEVICE_COMMIT_INTERVAL,
            _ => SAME_DEVICE_COMMIT_INTERVAL,
        }
    }
}

#[cfg(unix)]
fn same_device(a: &Path, b: &Path) -> Option<bool> {
    use std::os::unix::fs::MetadataExt;
    let a = std::fs::metadata(a).ok()?;
    let b = std::fs::metadata(b).ok()?;
    Some(a.dev() == b.dev())
}

#[cfg(not(unix))]
fn same_device(_a: &Path, _b: &Path) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DurabilityConfig::new("/data");
        assert_eq!(config.journal.dir, PathBuf::from("/data/journal"));
        assert_eq!(config.uncommitted_bytes_limit, DEFAULT_UNCOMMITTED_BYTES_LIMIT);
        assert_eq!(config.remap_every_n_commits, 10);
        assert_eq!(config.data_sync_interval, Duration::from_secs(60));
        assert!(!config.paranoid);
    }

    #[test]
    fn test_limit_feeds_remap_policy() {
        let config = DurabilityConfig::new("/data").with_uncommitted_bytes_limit(4096);
        assert_eq!(config.remap.private_bytes_limit, 4096);
    }

    #[test]
    fn test_explicit_commit_interval() {
        let config = DurabilityConfig::new("/data").with_commit_interval(Duration::from_millis(5));
        assert_eq!(config.effective_commit_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_same_device_interval() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("journal")).unwrap();
        let config = DurabilityConfig::new(dir.path());
        assert_eq!(config.effective_commit_interval(), SAME_DEVICE_COMMIT_INTERVAL);
    }
}
