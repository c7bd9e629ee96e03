//! The write-intent ledger.
//!
//! One `CommitJob` lives per durability context. Writers append intents and
//! durable operations while holding `w` or `W`; a group commit freezes it
//! under `R` or `W`, drains it into a [`JobSnapshot`], and resets it once the
//! snapshot no longer needs the counters.

use crate::intent::{coalesce, WriteIntent};
use crate::notify::{Epoch, NotifyAll};
use mmjournal_wal::DurableOp;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
struct Ledger {
    intents: Vec<WriteIntent>,
    ops: Vec<DurableOp>,
    /// Most recent intent, to skip the common repeat declaration cheaply.
    last_intent: Option<WriteIntent>,
}

/// Everything a commit captures, taken out of the ledger.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    /// Sorted, merged intents.
    pub intents: Vec<WriteIntent>,
    pub ops: Vec<DurableOp>,
    /// Intents noted before merging.
    pub declared: usize,
    /// Bytes declared by those intents.
    pub bytes: u64,
}

impl JobSnapshot {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.ops.is_empty()
    }

    /// Bytes covered once overlapping intents are merged.
    pub fn merged_bytes(&self) -> u64 {
        self.intents.iter().map(|i| i.len()).sum()
    }
}

/// The pending batch of intents and durable operations.
pub struct CommitJob {
    ledger: Mutex<Ledger>,
    bytes: AtomicU64,
    has_written: AtomicBool,
    notify: NotifyAll,
}

impl Default for CommitJob {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitJob {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            bytes: AtomicU64::new(0),
            has_written: AtomicBool::new(false),
            notify: NotifyAll::new(),
        }
    }

    /// Records an intent. Returns the number of intents now pending.
    pub fn note_intent(&self, intent: WriteIntent) -> usize {
        let mut ledger = self.ledger.lock();
        self.has_written.store(true, Ordering::Release);
        if ledger.last_intent == Some(intent) {
            return ledger.intents.len();
        }
        ledger.last_intent = Some(intent);
        ledger.intents.push(intent);
        self.bytes.fetch_add(intent.len(), Ordering::AcqRel);
        ledger.intents.len()
    }

    /// Records an operation that must be replayed even without ranges.
    pub fn note_op(&self, op: DurableOp) {
        let mut ledger = self.ledger.lock();
        self.has_written.store(true, Ordering::Release);
        ledger.ops.push(op);
    }

    /// Whether anything is pending.
    pub fn has_written(&self) -> bool {
        self.has_written.load(Ordering::Acquire)
    }

    /// Bytes declared since the last reset.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn intent_count(&self) -> usize {
        self.ledger.lock().intents.len()
    }

    /// Marks the start of a commit and returns its epoch.
    pub fn commiting_begin(&self) -> Epoch {
        self.notify.now()
    }

    /// Drains the ledger. The caller must exclude writers.
    pub fn take_snapshot(&self) -> JobSnapshot {
        let mut ledger = self.ledger.lock();
        let intents = std::mem::take(&mut ledger.intents);
        let ops = std::mem::take(&mut ledger.ops);
        ledger.last_intent = None;

        let declared = intents.len();
        JobSnapshot {
            intents: coalesce(intents),
            ops,
            declared,
            bytes: self.bytes(),
        }
    }

    /// Clears the counters after a snapshot was taken. Writers must still be
    /// excluded, so nothing can have been noted since the snapshot.
    pub fn committing_reset(&self) {
        let ledger = self.ledger.lock();
        debug_assert!(
            ledger.intents.is_empty() && ledger.ops.is_empty(),
            "write intents noted while a commit was preparing"
        );
        self.bytes.store(0, Ordering::Release);
        self.has_written.store(false, Ordering::Release);
    }

    /// Releases waiters registered before the commit at `epoch` began.
    pub fn notify_committed(&self, epoch: Epoch) {
        self.notify.notify_all(epoch);
    }

    pub fn notifier(&self) -> &NotifyAll {
        &self.notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmjournal_storage::ViewAddress;

    fn wi(start: u64, len: u32) -> WriteIntent {
        WriteIntent::new(ViewAddress(start), len)
    }

    #[test]
    fn test_note_and_snapshot() {
        let job = CommitJob::new();
        assert!(!job.has_written());

        job.note_intent(wi(100, 50));
        job.note_intent(wi(200, 60));
        job.note_intent(wi(120, 10));
        assert!(job.has_written());
        assert_eq!(job.bytes(), 120);
        assert_eq!(job.intent_count(), 3);

        let snapshot = job.take_snapshot();
        assert_eq!(snapshot.declared, 3);
        assert_eq!(snapshot.intents.len(), 2);
        assert_eq!(snapshot.merged_bytes(), 110);
        assert_eq!(snapshot.bytes, 120);

        // Counters survive until the reset.
        assert!(job.has_written());
        job.committing_reset();
        assert!(!job.has_written());
        assert_eq!(job.bytes(), 0);
        assert_eq!(job.intent_count(), 0);
    }

    #[test]
    fn test_repeated_intent_counted_once() {
        let job = CommitJob::new();
        assert_eq!(job.note_intent(wi(100, 8)), 1);
        assert_eq!(job.note_intent(wi(100, 8)), 1);
        assert_eq!(job.bytes(), 8);
    }

    #[test]
    fn test_ops_only_job() {
        let job = CommitJob::new();
        job.note_op(DurableOp::FileCreated {
            name: "test.0".to_string(),
            len: 4096,
        });
        assert!(job.has_written());
        assert_eq!(job.bytes(), 0);

        let snapshot = job.take_snapshot();
        assert!(!snapshot.is_empty());
        assert!(snapshot.intents.is_empty());
        assert_eq!(snapshot.ops.len(), 1);
    }

    #[test]
    fn test_epochs_release_waiters() {
        let job = CommitJob::new();
        let waiter = job.notifier().begin_wait();
        let epoch = job.commiting_begin();
        assert!(epoch > waiter);
        job.notify_committed(epoch);
        assert!(job
            .notifier()
            .wait_beyond_timeout(waiter, std::time::Duration::from_millis(10)));
    }
}
