//! Commit epochs.
//!
//! Every commit takes an epoch when it begins and announces it once its
//! section is in the journal. A waiter takes an epoch too and is released
//! by the first announced epoch beyond its own, i.e. by a commit that began
//! after it started waiting.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A commit epoch.
pub type Epoch = u64;

#[derive(Debug, Default)]
struct NotifyState {
    last_done: Epoch,
    last_returned: Epoch,
    waiting: usize,
}

/// Epoch counter with a wait/notify-all mechanism.
#[derive(Debug, Default)]
pub struct NotifyAll {
    state: Mutex<NotifyState>,
    cond: Condvar,
}

impl NotifyAll {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh epoch.
    pub fn now(&self) -> Epoch {
        let mut state = self.state.lock();
        state.last_returned += 1;
        state.last_returned
    }

    /// Registers a waiter and returns the epoch it waits beyond.
    pub fn begin_wait(&self) -> Epoch {
        let mut state = self.state.lock();
        state.waiting += 1;
        state.last_returned += 1;
        state.last_returned
    }

    /// Blocks until an epoch after `epoch` is announced.
    pub fn wait_beyond(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        while state.last_done <= epoch {
            self.cond.wait(&mut state);
        }
        state.waiting -= 1;
    }

    /// Like [`NotifyAll::wait_beyond`], giving up after `timeout`.
    /// Returns whether the epoch was reached.
    pub fn wait_beyond_timeout(&self, epoch: Epoch, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.last_done <= epoch {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.waiting -= 1;
        state.last_done > epoch
    }

    /// Blocks until a commit that begins after this call has been announced.
    pub fn await_beyond_now(&self) {
        let epoch = self.begin_wait();
        self.wait_beyond(epoch);
    }

    /// Announces that the commit which began at `epoch` is durable.
    pub fn notify_all(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        debug_assert!(epoch >= state.last_done, "commit epochs went backwards");
        state.last_done = epoch;
        drop(state);
        self.cond.notify_all();
    }

    /// Number of threads currently waiting.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }

    /// The last announced epoch.
    pub fn last_done(&self) -> Epoch {
        self.state.lock().last_done
    }
}
