//! Durability statistics.
//!
//! Counters accumulate into the current interval and into running totals.
//! The commit thread rotates intervals; readers see the last complete one.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Default length of a statistics interval.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(3);

/// Counters for one interval, or for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntervalStats {
    pub commits: u64,
    /// Bytes written to the journal, after compression.
    pub journaled_bytes: u64,
    /// Section body bytes before compression.
    pub uncompressed_bytes: u64,
    /// Bytes copied into shared views.
    pub data_file_bytes: u64,
    pub commits_in_write_lock: u64,
    /// Commits requested by foreground threads.
    pub early_commits: u64,
    pub prep_micros: u64,
    pub journal_micros: u64,
    pub data_files_micros: u64,
    pub remap_micros: u64,
    pub interval_millis: u64,
}

impl IntervalStats {
    fn add(&mut self, other: &IntervalStats) {
        self.commits += other.commits;
        self.journaled_bytes += other.journaled_bytes;
        self.uncompressed_bytes += other.uncompressed_bytes;
        self.data_file_bytes += other.data_file_bytes;
        self.commits_in_write_lock += other.commits_in_write_lock;
        self.early_commits += other.early_commits;
        self.prep_micros += other.prep_micros;
        self.journal_micros += other.journal_micros;
        self.data_files_micros += other.data_files_micros;
        self.remap_micros += other.remap_micros;
    }
}

/// Point-in-time copy of the statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    /// The last complete interval.
    pub last_interval: IntervalStats,
    /// Everything since the context was opened.
    pub totals: IntervalStats,
}

struct StatsInner {
    current: IntervalStats,
    previous: IntervalStats,
    totals: IntervalStats,
    started: Instant,
}

/// Rotating durability statistics.
pub struct DurStats {
    interval: Duration,
    inner: Mutex<StatsInner>,
}

impl DurStats {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(StatsInner {
                current: IntervalStats::default(),
                previous: IntervalStats::default(),
                totals: IntervalStats::default(),
                started: Instant::now(),
            }),
        }
    }

    /// Adds the counters set by `f` to the current interval and the totals.
    pub fn record<F: FnOnce(&mut IntervalStats)>(&self, f: F) {
        let mut delta = IntervalStats::default();
        f(&mut delta);
        let mut inner = self.inner.lock();
        inner.current.add(&delta);
        inner.totals.add(&delta);
    }

    /// Starts a new interval if the current one is over. Returns whether it
    /// rotated.
    pub fn rotate(&self) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let elapsed = inner.started.elapsed();
        if elapsed < self.interval {
            return false;
        }
        inner.current.interval_millis = elapsed.as_millis() as u64;
        inner.previous = std::mem::take(&mut inner.current);
        inner.started = Instant::now();
        true
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        let mut totals = inner.totals;
        totals.interval_millis = 0;
        StatsSnapshot {
            last_interval: inner.previous,
            totals,
        }
    }

    /// Renders the snapshot as JSON for status reporting.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_rotate() {
        let stats = DurStats::new(Duration::ZERO);
        stats.record(|s| {
            s.commits = 1;
            s.journaled_bytes = 100;
        });
        stats.record(|s| s.commits = 1);

        // Nothing rotated yet.
        assert_eq!(stats.snapshot().last_interval.commits, 0);
        assert_eq!(stats.snapshot().totals.commits, 2);

        assert!(stats.rotate());
        let snap = stats.snapshot();
        assert_eq!(snap.last_interval.commits, 2);
        assert_eq!(snap.last_interval.journaled_bytes, 100);

        assert!(stats.rotate());
        let snap = stats.snapshot();
        assert_eq!(snap.last_interval.commits, 0);
        assert_eq!(snap.totals.commits, 2);
    }

    #[test]
    fn test_rotate_waits_for_interval() {
        let stats = DurStats::new(Duration::from_secs(3600));
        stats.record(|s| s.early_commits = 1);
        assert!(!stats.rotate());
        assert_eq!(stats.snapshot().last_interval.early_commits, 0);
    }

    #[test]
    fn test_json() {
        let stats = DurStats::new(DEFAULT_STATS_INTERVAL);
        stats.record(|s| s.commits_in_write_lock = 3);
        let json = stats.to_json();
        assert_eq!(json["totals"]["commits_in_write_lock"], 3);
        assert_eq!(json["last_interval"]["commits"], 0);
    }
}
