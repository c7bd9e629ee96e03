//! The background commit thread.
//!
//! Sleeps for the commit interval unless woken by a durability waiter or by
//! the ledger crossing half the uncommitted bytes limit. Most rounds use the
//! limited commit; every Nth round, or when the private views have grown too
//! much, it takes `W`, commits under the downgraded `R` and remaps.

use crate::durability::Inner;
use crate::fatal::OrFatal;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    Timeout,
    Woken,
    Shutdown,
}

#[derive(Default)]
struct SignalState {
    wake: bool,
    shutdown: bool,
}

/// Wakes the commit thread early or stops it.
#[derive(Default)]
pub(crate) struct CommitSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CommitSignal {
    pub(crate) fn wake(&self) {
        self.state.lock().wake = true;
        self.cond.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Wakeup {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Wakeup::Shutdown;
            }
            if state.wake {
                state.wake = false;
                return Wakeup::Woken;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return match (state.shutdown, state.wake) {
                    (true, _) => Wakeup::Shutdown,
                    (false, true) => {
                        state.wake = false;
                        Wakeup::Woken
                    }
                    (false, false) => Wakeup::Timeout,
                };
            }
        }
    }
}

/// Body of the commit thread.
pub(crate) fn run(inner: Arc<Inner>) {
    let interval = inner.config.effective_commit_interval();
    tracing::info!(
        "Commit thread started (interval={}ms, data sync every {}s)",
        interval.as_millis(),
        inner.config.data_sync_interval.as_secs()
    );

    let mut round: u64 = 0;
    let mut last_data_sync = Instant::now();

    loop {
        inner.stats.rotate();

        if inner.signal.wait(interval) == Wakeup::Shutdown {
            break;
        }

        round += 1;
        inner.background_group_commit(round);

        if last_data_sync.elapsed() >= inner.config.data_sync_interval {
            inner.sync_data_files().or_fatal("syncing data files");
            last_data_sync = Instant::now();
        }
    }

    tracing::info!("Commit thread stopped after {} rounds", round);
}

impl Inner {
    /// Whether round `round` should take the exclusive lock and remap.
    pub(crate) fn wants_full_commit(&self, round: u64) -> bool {
        let remap = &self.config.remap;
        let every = self.config.remap_every_n_commits as u64;
        remap.always_remap
            || self.registry.private_map_bytes() >= remap.private_bytes_limit
            || (every > 0 && round % every == 0)
    }

    /// One background commit.
    pub(crate) fn background_group_commit(&self, round: u64) {
        if !self.wants_full_commit(round) {
            self.group_commit_limited();
            return;
        }

        let downgraded = self.lock.exclusive().downgrade();
        self.commit_under_lock();
        let exclusive = downgraded.upgrade();
        self.remap_private_views(exclusive.proof())
            .or_fatal("remapping private views");
    }

    /// Flushes every shared view, then drops journal files whose sections
    /// are all in the data files.
    pub(crate) fn sync_data_files(&self) -> Result<(), crate::error::DurError> {
        let _commit = self.group_commit_mutex.lock();
        let _files = self.files_lock.read();

        let started = Instant::now();
        let flushed = self.registry.flush_all()?;
        let removed = self.journal()?.remove_files_before_current()?;
        tracing::debug!(
            "Synced {} data files in {}ms, removed {} journal files",
            flushed,
            started.elapsed().as_millis(),
            removed
        );
        Ok(())
    }
}
