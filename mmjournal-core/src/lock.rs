//! Global lock hierarchy.
//!
//! Four modes, named after the letters used in logs:
//!
//! | mode | name          | compatible with |
//! |------|---------------|-----------------|
//! | `r`  | read          | `r`, `w`, `R`   |
//! | `w`  | intent write  | `r`, `w`        |
//! | `R`  | global read   | `r`, `R`        |
//! | `W`  | exclusive     | nothing         |
//!
//! Write intents may only be declared under `w` or `W`. A group commit
//! prepares its section under `R` (or `W`), which keeps writers out while
//! the private views are read.
//!
//! Pending `W` requests block new `r` and `w` acquisitions and pending `R`
//! requests block new `w` acquisitions, so commits are not starved by a
//! steady stream of writers.
//!
//! Guards are not reentrant: a thread must not acquire the same lock twice.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// A lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    IntentWrite,
    GlobalRead,
    Exclusive,
}

impl LockMode {
    pub fn as_char(self) -> char {
        match self {
            LockMode::Read => 'r',
            LockMode::IntentWrite => 'w',
            LockMode::GlobalRead => 'R',
            LockMode::Exclusive => 'W',
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Holder and waiter counts, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounts {
    pub readers: usize,
    pub writers: usize,
    pub global_readers: usize,
    pub exclusive: bool,
    pub pending_exclusive: usize,
    pub pending_global_read: usize,
}

#[derive(Default)]
struct LockState {
    counts: LockCounts,
    upgrading: bool,
}

struct LockShared {
    id: u64,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockShared {
    fn release<F: FnOnce(&mut LockCounts)>(&self, f: F) {
        let mut state = self.state.lock();
        f(&mut state.counts);
        drop(state);
        self.cond.notify_all();
    }
}

/// The process-wide lock of one durability context.
pub struct GlobalLock {
    shared: Arc<LockShared>,
}

impl Default for GlobalLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalLock {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LockShared {
                id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(LockState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Identity of this lock; guards carry it so that a guard from another
    /// context is never accepted.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Acquires `r`.
    pub fn read(&self) -> ReadGuard {
        let mut state = self.shared.state.lock();
        while state.counts.exclusive || state.counts.pending_exclusive > 0 {
            self.shared.cond.wait(&mut state);
        }
        state.counts.readers += 1;
        ReadGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Acquires `w`.
    pub fn intent_write(&self) -> IntentWriteGuard {
        let mut state = self.shared.state.lock();
        while state.counts.exclusive
            || state.counts.global_readers > 0
            || state.counts.pending_exclusive > 0
            || state.counts.pending_global_read > 0
        {
            self.shared.cond.wait(&mut state);
        }
        state.counts.writers += 1;
        IntentWriteGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Acquires `R`.
    pub fn global_read(&self) -> GlobalReadGuard {
        let mut state = self.shared.state.lock();
        state.counts.pending_global_read += 1;
        while state.counts.exclusive || state.counts.writers > 0 {
            self.shared.cond.wait(&mut state);
        }
        state.counts.pending_global_read -= 1;
        state.counts.global_readers += 1;
        GlobalReadGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Acquires `W`.
    pub fn exclusive(&self) -> ExclusiveGuard {
        let mut state = self.shared.state.lock();
        state.counts.pending_exclusive += 1;
        while state.counts.exclusive
            || state.counts.readers > 0
            || state.counts.writers > 0
            || state.counts.global_readers > 0
        {
            self.shared.cond.wait(&mut state);
        }
        state.counts.pending_exclusive -= 1;
        state.counts.exclusive = true;
        ExclusiveGuard {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    pub fn counts(&self) -> LockCounts {
        self.shared.state.lock().counts
    }
}

/// Evidence that a lock of some mode is held, without access to the guard.
#[derive(Debug, Clone, Copy)]
pub struct LockProof<'a> {
    lock_id: u64,
    _held: PhantomData<&'a ()>,
}

impl LockProof<'_> {
    fn new(lock_id: u64) -> Self {
        Self {
            lock_id,
            _held: PhantomData,
        }
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }
}

/// What the calling thread holds when it asks for a commit.
#[derive(Clone, Copy)]
pub enum LockContext<'a> {
    Unlocked,
    Read(LockProof<'a>),
    IntentWrite(&'a IntentWriteGuard),
    GlobalRead(LockProof<'a>),
    Exclusive(LockProof<'a>),
}

impl LockContext<'_> {
    pub fn mode(&self) -> Option<LockMode> {
        match self {
            LockContext::Unlocked => None,
            LockContext::Read(_) => Some(LockMode::Read),
            LockContext::IntentWrite(_) => Some(LockMode::IntentWrite),
            LockContext::GlobalRead(_) => Some(LockMode::GlobalRead),
            LockContext::Exclusive(_) => Some(LockMode::Exclusive),
        }
    }

    pub fn lock_id(&self) -> Option<u64> {
        match self {
            LockContext::Unlocked => None,
            LockContext::IntentWrite(guard) => Some(guard.shared.id),
            LockContext::Read(proof)
            | LockContext::GlobalRead(proof)
            | LockContext::Exclusive(proof) => Some(proof.lock_id),
        }
    }
}

impl fmt::Debug for LockContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode() {
            Some(mode) => write!(f, "LockContext({})", mode),
            None => write!(f, "LockContext(unlocked)"),
        }
    }
}

/// A guard under which write intents may be declared.
pub trait WriteLock {
    fn context(&self) -> LockContext<'_>;
}

/// Shared read (`r`).
pub struct ReadGuard {
    shared: Arc<LockShared>,
}

impl ReadGuard {
    pub fn context(&self) -> LockContext<'_> {
        LockContext::Read(LockProof::new(self.shared.id))
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.shared.release(|c| c.readers -= 1);
    }
}

/// Intent write (`w`).
pub struct IntentWriteGuard {
    shared: Arc<LockShared>,
}

impl IntentWriteGuard {
    /// Tries to turn this `w` into `W` until the returned guard is dropped.
    ///
    /// Fails immediately if another upgrade is in progress, and after
    /// `timeout` if other holders do not leave.
    pub fn try_upgrade(&self, timeout: Duration) -> Option<UpgradedGuard<'_>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.upgrading {
            return None;
        }
        state.upgrading = true;
        state.counts.pending_exclusive += 1;

        let deadline = Instant::now() + timeout;
        let blocked = |c: &LockCounts| c.readers > 0 || c.writers > 1 || c.global_readers > 0;
        while blocked(&state.counts) {
            if shared.cond.wait_until(&mut state, deadline).timed_out() && blocked(&state.counts) {
                state.upgrading = false;
                state.counts.pending_exclusive -= 1;
                drop(state);
                shared.cond.notify_all();
                return None;
            }
        }

        state.upgrading = false;
        state.counts.pending_exclusive -= 1;
        state.counts.writers -= 1;
        state.counts.exclusive = true;
        Some(UpgradedGuard { parent: self })
    }
}

impl WriteLock for IntentWriteGuard {
    fn context(&self) -> LockContext<'_> {
        LockContext::IntentWrite(self)
    }
}

impl Drop for IntentWriteGuard {
    fn drop(&mut self) {
        self.shared.release(|c| c.writers -= 1);
    }
}

/// `W` obtained by upgrading a `w`; dropping it goes back to `w`.
pub struct UpgradedGuard<'a> {
    parent: &'a IntentWriteGuard,
}

impl UpgradedGuard<'_> {
    pub fn proof(&self) -> LockProof<'_> {
        LockProof::new(self.parent.shared.id)
    }
}

impl WriteLock for UpgradedGuard<'_> {
    fn context(&self) -> LockContext<'_> {
        LockContext::Exclusive(self.proof())
    }
}

impl Drop for UpgradedGuard<'_> {
    fn drop(&mut self) {
        self.parent.shared.release(|c| {
            c.exclusive = false;
            c.writers += 1;
        });
    }
}

/// Global read (`R`).
pub struct GlobalReadGuard {
    shared: Arc<LockShared>,
}

impl GlobalReadGuard {
    pub fn context(&self) -> LockContext<'_> {
        LockContext::GlobalRead(LockProof::new(self.shared.id))
    }
}

impl Drop for GlobalReadGuard {
    fn drop(&mut self) {
        self.shared.release(|c| c.global_readers -= 1);
    }
}

/// Exclusive (`W`).
pub struct ExclusiveGuard {
    shared: Option<Arc<LockShared>>,
}

impl ExclusiveGuard {
    fn lock_id(&self) -> u64 {
        self.shared.as_ref().map(|s| s.id).unwrap_or(0)
    }

    pub fn proof(&self) -> LockProof<'_> {
        LockProof::new(self.lock_id())
    }

    /// Steps down to `R` without letting writers in.
    pub fn downgrade(mut self) -> DowngradedGuard {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => unreachable!("exclusive guard without a lock"),
        };
        shared.release(|c| {
            c.exclusive = false;
            c.global_readers += 1;
        });
        DowngradedGuard {
            shared: Some(shared),
        }
    }
}

impl WriteLock for ExclusiveGuard {
    fn context(&self) -> LockContext<'_> {
        LockContext::Exclusive(self.proof())
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(|c| c.exclusive = false);
        }
    }
}

/// `R` obtained by downgrading a `W`; it can be upgraded back.
pub struct DowngradedGuard {
    shared: Option<Arc<LockShared>>,
}

impl DowngradedGuard {
    pub fn context(&self) -> LockContext<'_> {
        let id = self.shared.as_ref().map(|s| s.id).unwrap_or(0);
        LockContext::GlobalRead(LockProof::new(id))
    }

    /// Waits for other readers to leave and takes `W` again. Writers cannot
    /// get in between.
    pub fn upgrade(mut self) -> ExclusiveGuard {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => unreachable!("downgraded guard without a lock"),
        };
        {
            let mut state = shared.state.lock();
            state.counts.pending_exclusive += 1;
            while state.counts.exclusive
                || state.counts.readers > 0
                || state.counts.writers > 0
                || state.counts.global_readers > 1
            {
                shared.cond.wait(&mut state);
            }
            state.counts.pending_exclusive -= 1;
            state.counts.global_readers -= 1;
            state.counts.exclusive = true;
        }
        ExclusiveGuard {
            shared: Some(shared),
        }
    }
}

impl Drop for DowngradedGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(|c| c.global_readers -= 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    /// Acquires on another thread and reports when the acquisition happened.
    fn acquire_in_thread<F>(lock: &Arc<GlobalLock>, acquire: F) -> mpsc::Receiver<()>
    where
        F: FnOnce(&GlobalLock) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let lock = Arc::clone(lock);
        thread::spawn(move || {
            acquire(&lock);
            let _ = tx.send(());
        });
        rx
    }

    #[test]
    fn test_shared_modes_coexist() {
        let lock = GlobalLock::new();
        let _r1 = lock.read();
        let _w1 = lock.intent_write();
        let _w2 = lock.intent_write();
        let _r2 = lock.read();

        let counts = lock.counts();
        assert_eq!(counts.readers, 2);
        assert_eq!(counts.writers, 2);
    }

    #[test]
    fn test_global_read_excludes_writers() {
        let lock = Arc::new(GlobalLock::new());
        let r = lock.global_read();

        let rx = acquire_in_thread(&lock, |l| drop(l.intent_write()));
        assert!(rx.recv_timeout(SHORT).is_err());

        // Readers still get in.
        let _reader = lock.read();

        drop(r);
        assert!(rx.recv_timeout(LONG).is_ok());
    }

    #[test]
    fn test_exclusive_excludes_everything() {
        let lock = Arc::new(GlobalLock::new());
        let w = lock.exclusive();

        let rx_read = acquire_in_thread(&lock, |l| drop(l.read()));
        let rx_global = acquire_in_thread(&lock, |l| drop(l.global_read()));
        assert!(rx_read.recv_timeout(SHORT).is_err());
        assert!(rx_global.recv_timeout(SHORT).is_err());

        drop(w);
        assert!(rx_read.recv_timeout(LONG).is_ok());
        assert!(rx_global.recv_timeout(LONG).is_ok());
    }

    #[test]
    fn test_pending_exclusive_blocks_new_readers() {
        let lock = Arc::new(GlobalLock::new());
        let reader = lock.read();

        let rx_exclusive = acquire_in_thread(&lock, |l| drop(l.exclusive()));
        while lock.counts().pending_exclusive == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let rx_read = acquire_in_thread(&lock, |l| drop(l.read()));
        assert!(rx_read.recv_timeout(SHORT).is_err());

        drop(reader);
        assert!(rx_exclusive.recv_timeout(LONG).is_ok());
        assert!(rx_read.recv_timeout(LONG).is_ok());
    }

    #[test]
    fn test_downgrade_keeps_writers_out() {
        let lock = Arc::new(GlobalLock::new());
        let downgraded = lock.exclusive().downgrade();

        let _reader = lock.read();
        let other_global = lock.global_read();
        let rx_write = acquire_in_thread(&lock, |l| drop(l.intent_write()));
        assert!(rx_write.recv_timeout(SHORT).is_err());

        drop(other_global);
        drop(_reader);
        let exclusive = downgraded.upgrade();
        assert!(lock.counts().exclusive);
        assert!(rx_write.recv_timeout(SHORT).is_err());

        drop(exclusive);
        assert!(rx_write.recv_timeout(LONG).is_ok());
    }

    #[test]
    fn test_upgrade_waits_for_other_global_readers() {
        let lock = Arc::new(GlobalLock::new());
        let downgraded = lock.exclusive().downgrade();
        let other = lock.global_read();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let w = downgraded.upgrade();
            let _ = tx.send(());
            drop(w);
        });
        assert!(rx.recv_timeout(SHORT).is_err());

        drop(other);
        assert!(rx.recv_timeout(LONG).is_ok());
        handle.join().unwrap();
        assert_eq!(lock.counts(), LockCounts::default());
    }

    #[test]
    fn test_try_upgrade_from_intent_write() {
        let lock = GlobalLock::new();
        let w = lock.intent_write();
        {
            let upgraded = w.try_upgrade(SHORT).expect("sole writer should upgrade");
            assert!(matches!(upgraded.context(), LockContext::Exclusive(_)));
            let counts = lock.counts();
            assert!(counts.exclusive);
            assert_eq!(counts.writers, 0);
        }
        let counts = lock.counts();
        assert!(!counts.exclusive);
        assert_eq!(counts.writers, 1);
    }

    #[test]
    fn test_try_upgrade_times_out_with_other_writers() {
        let lock = GlobalLock::new();
        let w1 = lock.intent_write();
        let _w2 = lock.intent_write();

        assert!(w1.try_upgrade(Duration::from_millis(20)).is_none());
        let counts = lock.counts();
        assert_eq!(counts.pending_exclusive, 0);
        assert_eq!(counts.writers, 2);
    }

    #[test]
    fn test_contexts() {
        let lock = GlobalLock::new();
        {
            let r = lock.read();
            assert_eq!(r.context().mode(), Some(LockMode::Read));
            assert_eq!(r.context().lock_id(), Some(lock.id()));
        }
        {
            let w = lock.intent_write();
            assert_eq!(WriteLock::context(&w).mode(), Some(LockMode::IntentWrite));
        }
        {
            let g = lock.global_read();
            assert_eq!(g.context().mode(), Some(LockMode::GlobalRead));
        }
        let x = lock.exclusive();
        assert_eq!(WriteLock::context(&x).mode(), Some(LockMode::Exclusive));
        assert_eq!(LockContext::Unlocked.lock_id(), None);
        assert_ne!(GlobalLock::new().id(), lock.id());
    }
}
