//! The durability context.
//!
//! [`Durability`] owns the lock hierarchy, the open data files, the journal,
//! the write-intent ledger and the commit thread of one store. Writers hold
//! `w` (or `W`) from [`Durability::lock`], declare what they are about to
//! change, and change it in the private views. Commits capture the declared
//! ranges in the journal before copying them into the shared views.
//!
//! ```no_run
//! use mmjournal_core::{Durability, DurabilityConfig};
//!
//! # fn main() -> Result<(), mmjournal_core::DurError> {
//! let dur = Durability::open(DurabilityConfig::new("/var/lib/mmjournal"))?;
//! dur.startup()?;
//!
//! let guard = dur.lock().intent_write();
//! let file = dur.create_data_file(&guard, "test.0", 64 * 1024)?;
//! dur.writing(&guard, file.base().offset(100), b"hello")?;
//! drop(guard);
//!
//! dur.await_commit()?;
//! dur.shutdown()?;
//! # Ok(())
//! # }
//! ```

use crate::commit_job::CommitJob;
use crate::commit_thread::{self, CommitSignal};
use crate::config::DurabilityConfig;
use crate::error::DurError;
use crate::intent::WriteIntent;
use crate::lock::{ExclusiveGuard, GlobalLock, IntentWriteGuard, LockContext, WriteLock};
use crate::stats::{DurStats, StatsSnapshot};
use mmjournal_storage::{
    replay_journal, DurableFile, FileId, FileRegistry, ReplayOutcome, Remapper, ViewAddress,
};
use mmjournal_wal::{remove_journal_files, DurableOp, Journal, JournalStats, ScanStop};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// State shared with the commit thread.
pub(crate) struct Inner {
    pub(crate) config: DurabilityConfig,
    pub(crate) lock: GlobalLock,
    pub(crate) registry: FileRegistry,
    journal: OnceLock<Journal>,
    pub(crate) job: CommitJob,
    pub(crate) stats: DurStats,
    pub(crate) remapper: Remapper,
    /// Serializes group commits.
    pub(crate) group_commit_mutex: Mutex<()>,
    /// Held shared while sections are journaled and applied, exclusively
    /// while files are closed or remapped.
    pub(crate) files_lock: RwLock<()>,
    pub(crate) signal: CommitSignal,
    shut_down: AtomicBool,
}

impl Inner {
    pub(crate) fn journal(&self) -> Result<&Journal, DurError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DurError::ShutDown);
        }
        self.journal.get().ok_or(DurError::NotStarted)
    }

    fn is_running(&self) -> bool {
        self.journal().is_ok()
    }
}

/// Counters and gauges for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DurabilityStatus {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub journal: Option<JournalStats>,
    pub uncommitted_bytes: u64,
    pub pending_intents: usize,
    pub private_map_bytes: u64,
    pub open_files: usize,
    pub commit_interval_millis: u64,
}

/// Write-ahead durability for one store.
pub struct Durability {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Durability {
    /// Creates the context. Nothing is recovered or started yet.
    pub fn open(config: DurabilityConfig) -> Result<Self, DurError> {
        let registry = FileRegistry::new(&config.data_dir, config.view_backend)?;
        std::fs::create_dir_all(&config.journal.dir)?;

        let stats = DurStats::new(config.stats_interval);
        let inner = Inner {
            config,
            lock: GlobalLock::new(),
            registry,
            journal: OnceLock::new(),
            job: CommitJob::new(),
            stats,
            remapper: Remapper::new(),
            group_commit_mutex: Mutex::new(()),
            files_lock: RwLock::new(()),
            signal: CommitSignal::default(),
            shut_down: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
            thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DurabilityConfig {
        &self.inner.config
    }

    /// Recovers, opens the journal and starts the commit thread.
    pub fn startup(&self) -> Result<ReplayOutcome, DurError> {
        if self.inner.journal.get().is_some() {
            return Err(DurError::AlreadyStarted);
        }

        let outcome = self.recover()?;

        let journal = Journal::open(
            self.inner.config.journal.clone(),
            outcome.report.max_sequence,
        )?;
        if self.inner.journal.set(journal).is_err() {
            return Err(DurError::AlreadyStarted);
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("mmjournal-commit".to_string())
            .spawn(move || commit_thread::run(inner))?;
        *self.thread.lock() = Some(handle);

        tracing::info!(
            "Durability started (data={}, journal={})",
            self.inner.config.data_dir.display(),
            self.inner.config.journal.dir.display()
        );
        Ok(outcome)
    }

    /// Replays the journal into the data files and deletes it.
    ///
    /// Runs before any data file is opened. Fails if the journal holds data
    /// but no usable section.
    pub fn recover(&self) -> Result<ReplayOutcome, DurError> {
        if self.inner.journal.get().is_some() {
            return Err(DurError::AlreadyStarted);
        }
        if !self.inner.registry.is_empty() {
            return Err(DurError::InvalidState(
                "recovery must run before data files are opened".to_string(),
            ));
        }

        let journal_dir = &self.inner.config.journal.dir;
        let outcome = replay_journal(journal_dir, &self.inner.config.data_dir)?;
        let report = &outcome.report;

        if report.is_unrecoverable() {
            let reason = match &report.stop {
                ScanStop::Corrupt { file_id, offset, reason } => {
                    format!("journal file {} at offset {}: {}", file_id, offset, reason)
                }
                other => format!("{:?}", other),
            };
            tracing::error!(
                "Journal at {} is not recoverable: {}",
                journal_dir.display(),
                reason
            );
            return Err(DurError::UnrecoverableJournal {
                dir: journal_dir.clone(),
                reason,
            });
        }

        match &report.stop {
            ScanStop::End => {}
            ScanStop::Truncated { file_id, offset } => tracing::info!(
                "Discarded partial section at end of journal file {} (offset {})",
                file_id,
                offset
            ),
            ScanStop::Corrupt { file_id, offset, reason } => tracing::warn!(
                "Stopped recovery at journal file {} offset {}: {}",
                file_id,
                offset,
                reason
            ),
        }

        if report.valid_sections > 0 {
            tracing::info!(
                "Recovered {} journal sections ({} bytes into {} files, {} bytes discarded)",
                report.valid_sections,
                outcome.applied.bytes,
                outcome.files.files_touched,
                report.bytes_discarded
            );
        }

        let removed = remove_journal_files(journal_dir)?;
        if removed > 0 {
            tracing::debug!("Removed {} recovered journal files", removed);
        }
        Ok(outcome)
    }

    /// The lock hierarchy guarding this context.
    pub fn lock(&self) -> &GlobalLock {
        &self.inner.lock
    }

    fn check_context(&self, ctx: LockContext<'_>) {
        if let Some(id) = ctx.lock_id() {
            assert_eq!(
                id,
                self.inner.lock.id(),
                "lock guard belongs to another durability context"
            );
        }
    }

    /// Creates a data file and journals its creation.
    pub fn create_data_file<G: WriteLock + ?Sized>(
        &self,
        guard: &G,
        name: &str,
        len: u64,
    ) -> Result<Arc<DurableFile>, DurError> {
        self.check_context(guard.context());
        self.inner.journal()?;
        let file = self.inner.registry.create(name, len)?;
        self.created_file(guard, name, len);
        Ok(file)
    }

    /// Opens an existing data file.
    pub fn open_data_file<G: WriteLock + ?Sized>(
        &self,
        guard: &G,
        name: &str,
    ) -> Result<Arc<DurableFile>, DurError> {
        self.check_context(guard.context());
        self.inner.journal()?;
        Ok(self.inner.registry.open(name)?)
    }

    /// Closes a data file, committing pending writes first.
    pub fn close_data_file(&self, guard: &ExclusiveGuard, id: FileId) -> Result<(), DurError> {
        self.check_context(guard.context());
        if self.inner.job.has_written() {
            tracing::debug!("Committing before closing data file {}", id);
            self.inner.commit_in_write_lock(guard.proof());
        }
        let _files = self.inner.files_lock.write();
        self.inner.registry.close(id)?;
        Ok(())
    }

    /// Records that a data file was created, so recovery recreates it.
    pub fn created_file<G: WriteLock + ?Sized>(&self, guard: &G, name: &str, len: u64) {
        self.check_context(guard.context());
        assert!(
            self.inner.is_running(),
            "file creation recorded before startup"
        );
        self.inner.job.note_op(DurableOp::FileCreated {
            name: name.to_string(),
            len,
        });
    }

    /// Declares that `[addr, addr + len)` is about to change in the private
    /// views.
    ///
    /// Commits first, from this thread, if the ledger is over the uncommitted
    /// bytes limit or the intent ceiling.
    ///
    /// The intent ceiling is best-effort under `w`: when the upgrade to `W`
    /// times out, or another holder is already upgrading, the intent is
    /// recorded anyway and the ledger grows past the ceiling until the next
    /// commit. Under `r` no early commit is attempted at all.
    ///
    /// # Panics
    ///
    /// Panics on a zero-length or null range, on a range outside every open
    /// file, on a guard of another context, and before startup.
    pub fn declare_write_intent<G: WriteLock + ?Sized>(&self, guard: &G, addr: ViewAddress, len: u32) {
        let ctx = guard.context();
        self.check_context(ctx);
        assert!(
            self.inner.is_running(),
            "write intent declared before startup"
        );
        let intent = WriteIntent::new(addr, len);
        if let Err(e) = self.inner.registry.resolve(addr, len as u64) {
            panic!("write intent outside every private view: {}", e);
        }

        let pending = self.inner.job.intent_count();
        let over_ceiling = pending >= self.inner.config.max_intents;
        if (over_ceiling || self.is_commit_needed()) && !self.commit_if_needed(ctx, over_ceiling) {
            tracing::debug!(
                "Early commit skipped under {:?}; recording intent with {} pending ({} bytes)",
                ctx,
                pending,
                self.inner.job.bytes()
            );
        }

        let limit = self.inner.config.uncommitted_bytes_limit;
        let before = self.inner.job.bytes();
        self.inner.job.note_intent(intent);
        let after = self.inner.job.bytes();
        if before <= limit / 2 && after > limit / 2 {
            self.inner.signal.wake();
        }
    }

    /// Declares an intent for `data` and writes it to the private views.
    pub fn writing<G: WriteLock + ?Sized>(
        &self,
        guard: &G,
        addr: ViewAddress,
        data: &[u8],
    ) -> Result<(), DurError> {
        let len = u32::try_from(data.len()).map_err(|_| {
            DurError::InvalidState(format!("write of {} bytes exceeds one intent", data.len()))
        })?;
        self.declare_write_intent(guard, addr, len);
        self.inner.registry.write_private(addr, data)?;
        Ok(())
    }

    /// Reads from the private views.
    pub fn read(&self, addr: ViewAddress, buf: &mut [u8]) -> Result<(), DurError> {
        Ok(self.inner.registry.read(addr, buf)?)
    }

    /// Commits now, from this thread, in the way the caller's lock allows.
    ///
    /// Returns whether a commit ran. A caller holding `w` only commits if it
    /// can briefly upgrade to `W`.
    pub fn commit_now(&self, ctx: LockContext<'_>) -> bool {
        self.check_context(ctx);
        self.inner.stats.record(|s| s.early_commits = 1);
        match ctx {
            LockContext::Unlocked | LockContext::Read(_) => {
                self.inner.group_commit_limited();
                true
            }
            LockContext::GlobalRead(_) => {
                self.inner.commit_under_lock();
                true
            }
            LockContext::Exclusive(proof) => {
                self.inner.commit_in_write_lock(proof);
                true
            }
            LockContext::IntentWrite(guard) => self.commit_upgrading(guard),
        }
    }

    /// Commits if the uncommitted bytes limit is reached, or always with
    /// `force`. Returns whether a commit ran.
    pub fn commit_if_needed(&self, ctx: LockContext<'_>, force: bool) -> bool {
        if !force && !self.is_commit_needed() {
            return false;
        }
        self.check_context(ctx);
        match ctx {
            LockContext::Unlocked => self.commit_if_needed_unlocked(force),
            LockContext::Read(_) => self.commit_if_needed_reading(),
            LockContext::IntentWrite(guard) => self.commit_upgrading(guard),
            LockContext::GlobalRead(_) | LockContext::Exclusive(_) => self.commit_now(ctx),
        }
    }

    /// Takes `R`, checks again, and commits under it.
    fn commit_if_needed_unlocked(&self, force: bool) -> bool {
        let global = self.inner.lock.global_read();
        if !force && !self.is_commit_needed() {
            return false;
        }
        self.commit_now(global.context())
    }

    /// A reader cannot keep writers out, so it leaves the commit to others.
    fn commit_if_needed_reading(&self) -> bool {
        tracing::trace!("Commit needed but caller only holds r");
        false
    }

    /// Upgrades `w` to `W` for the commit if no one else is in the way.
    fn commit_upgrading(&self, guard: &IntentWriteGuard) -> bool {
        match guard.try_upgrade(self.inner.config.upgrade_timeout) {
            Some(upgraded) => {
                self.inner.commit_in_write_lock(upgraded.proof());
                true
            }
            None => {
                tracing::debug!("Could not upgrade w for an early commit");
                false
            }
        }
    }

    /// Blocks until a commit that begins after this call is journaled.
    ///
    /// Must be called without holding the lock: the commit it waits for
    /// may need `W`.
    pub fn await_commit(&self) -> Result<(), DurError> {
        self.inner.journal()?;
        let notify = self.inner.job.notifier();
        let epoch = notify.begin_wait();
        self.inner.signal.wake();
        notify.wait_beyond(epoch);
        Ok(())
    }

    /// Like [`Durability::await_commit`], giving up after `timeout`. Returns
    /// whether the commit was journaled in time.
    pub fn await_commit_timeout(&self, timeout: Duration) -> Result<bool, DurError> {
        self.inner.journal()?;
        let notify = self.inner.job.notifier();
        let epoch = notify.begin_wait();
        self.inner.signal.wake();
        Ok(notify.wait_beyond_timeout(epoch, timeout))
    }

    /// Whether the ledger has reached the uncommitted bytes limit.
    pub fn is_commit_needed(&self) -> bool {
        self.inner.job.bytes() >= self.inner.config.uncommitted_bytes_limit
    }

    /// Whether anything is waiting to be committed.
    pub fn has_written(&self) -> bool {
        self.inner.job.has_written()
    }

    pub fn uncommitted_bytes(&self) -> u64 {
        self.inner.job.bytes()
    }

    /// Commits, flushes every data file and empties the journal, so that the
    /// next start has nothing to replay.
    pub fn sync_data_and_truncate_journal(&self, guard: &ExclusiveGuard) -> Result<(), DurError> {
        self.check_context(guard.context());
        let journal = self.inner.journal()?;

        self.inner.commit_in_write_lock(guard.proof());

        let _commit = self.inner.group_commit_mutex.lock();
        let flushed = self.inner.registry.flush_all()?;
        let removed = journal.truncate()?;
        tracing::info!(
            "Flushed {} data files and truncated journal ({} files removed)",
            flushed,
            removed
        );
        Ok(())
    }

    /// Stops the commit thread, syncs the data files and closes the journal.
    pub fn shutdown(&self) -> Result<(), DurError> {
        self.stop_thread();
        if !self.inner.is_running() {
            return Ok(());
        }

        {
            let guard = self.inner.lock.exclusive();
            self.sync_data_and_truncate_journal(&guard)?;
            self.inner.journal()?.close()?;
            self.inner.shut_down.store(true, Ordering::Release);
        }

        tracing::info!("Durability shut down");
        Ok(())
    }

    fn stop_thread(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            self.inner.signal.shutdown();
            if handle.join().is_err() {
                tracing::error!("Commit thread panicked");
            }
        }
    }

    pub fn stats(&self) -> DurabilityStatus {
        let inner = &self.inner;
        DurabilityStatus {
            stats: inner.stats.snapshot(),
            journal: inner.journal().ok().map(|j| j.stats()),
            uncommitted_bytes: inner.job.bytes(),
            pending_intents: inner.job.intent_count(),
            private_map_bytes: inner.registry.private_map_bytes(),
            open_files: inner.registry.len(),
            commit_interval_millis: inner.config.effective_commit_interval().as_millis() as u64,
        }
    }

    /// Looks up an open data file.
    pub fn data_file(&self, id: FileId) -> Option<Arc<DurableFile>> {
        self.inner.registry.get(id)
    }

    /// Reads `buf.len()` bytes at `offset` of a data file's shared view.
    pub fn read_shared(&self, id: FileId, offset: u64, buf: &mut [u8]) -> Result<(), DurError> {
        let file = self
            .inner
            .registry
            .get(id)
            .ok_or(mmjournal_storage::StorageError::UnknownFileId(id.0))?;
        Ok(file.read_shared(offset, buf)?)
    }
}

impl Drop for Durability {
    fn drop(&mut self) {
        self.stop_thread();
        if self.inner.is_running() && self.inner.job.has_written() {
            tracing::warn!(
                "Durability dropped with {} uncommitted bytes",
                self.inner.job.bytes()
            );
        }
        if let Some(journal) = self.inner.journal.get() {
            if let Err(e) = journal.sync() {
                tracing::warn!("Failed to sync journal on drop: {}", e);
            }
        }
    }
}
