//! The group commit state machine.
//!
//! A commit begins an epoch, drains the ledger into a section while writers
//! are excluded, journals the section, releases waiters, then copies the
//! section into the shared views. Only one commit runs at a time; the commit
//! mutex is always taken after the global lock and before the files lock.
//!
//! Two variants exist. The limited one holds `R` only while preparing and
//! never remaps. The locked one runs entirely under the caller's `R` or `W`;
//! callers holding `W` follow it with a remap pass.

use crate::durability::Inner;
use crate::error::DurError;
use crate::fatal::{fatal, OrFatal};
use crate::lock::LockProof;
use crate::prep::prep_log_buffer;
use mmjournal_storage::{apply_section, ApplyStats, RemapPass, SharedViewTarget};
use mmjournal_wal::{JournalWrite, PreparedSection};
use std::time::Instant;

/// Timings and sizes of one commit, folded into the statistics.
#[derive(Debug, Default)]
struct CommitRecord {
    journaled: Option<JournalWrite>,
    uncompressed: u64,
    applied: ApplyStats,
    prep_micros: u64,
    journal_micros: u64,
    data_files_micros: u64,
}

fn micros_since(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

impl Inner {
    /// Commits while holding `R` only for the prepare phase.
    ///
    /// The caller must hold no lock or `r`.
    pub(crate) fn group_commit_limited(&self) {
        let global = self.lock.global_read();
        let _commit = self.group_commit_mutex.lock();

        let epoch = self.job.commiting_begin();
        if !self.job.has_written() {
            self.job.notify_committed(epoch);
            return;
        }

        let mut record = CommitRecord::default();
        let started = Instant::now();
        let section = self.prep().or_fatal("preparing the log buffer");
        record.prep_micros = micros_since(started);

        let _files = self.files_lock.read();
        self.job.committing_reset();
        drop(global);

        self.write_section(&section, epoch, &mut record);
        self.record_commit(&record);
    }

    /// Commits under the `R` or `W` the caller holds. Returns whether there
    /// was anything to commit.
    pub(crate) fn commit_under_lock(&self) -> bool {
        let _commit = self.group_commit_mutex.lock();

        let epoch = self.job.commiting_begin();
        if !self.job.has_written() {
            self.job.notify_committed(epoch);
            return false;
        }

        let mut record = CommitRecord::default();
        let started = Instant::now();
        let section = self.prep().or_fatal("preparing the log buffer");
        record.prep_micros = micros_since(started);

        {
            let _files = self.files_lock.read();
            self.write_section(&section, epoch, &mut record);
        }

        if self.config.paranoid {
            self.validate_all_maps_match();
        }

        self.job.committing_reset();
        self.record_commit(&record);
        true
    }

    /// Commits under `W` and remaps afterwards.
    pub(crate) fn commit_in_write_lock(&self, proof: LockProof<'_>) {
        self.check_proof(proof);
        let committed = self.commit_under_lock();
        if committed {
            self.stats.record(|s| s.commits_in_write_lock = 1);
        }
        self.remap_private_views(proof)
            .or_fatal("remapping private views");
    }

    /// Journals the section, releases waiters, and applies it.
    fn write_section(&self, section: &PreparedSection, epoch: u64, record: &mut CommitRecord) {
        let started = Instant::now();
        let written = self
            .write_to_journal(section)
            .or_fatal("writing to the journal");
        record.journal_micros = micros_since(started);
        record.journaled = Some(written);
        record.uncompressed = section.body.len() as u64;

        self.job.notify_committed(epoch);

        let started = Instant::now();
        record.applied = self
            .write_to_data_files(section)
            .or_fatal("writing to the data files");
        record.data_files_micros = micros_since(started);

        tracing::debug!(
            "Committed section {}: {} ranges, {} bytes journaled, {} bytes applied",
            section.sequence,
            section.range_count,
            written.bytes,
            record.applied.bytes
        );
    }

    fn prep(&self) -> Result<PreparedSection, DurError> {
        let journal = self.journal()?;
        let snapshot = self.job.take_snapshot();
        prep_log_buffer(&snapshot, &self.registry, journal.reserve_sequence())
    }

    fn write_to_journal(&self, section: &PreparedSection) -> Result<JournalWrite, DurError> {
        Ok(self.journal()?.append(section)?)
    }

    /// Copies the journaled ranges into the shared views.
    fn write_to_data_files(&self, section: &PreparedSection) -> Result<ApplyStats, DurError> {
        let body = section.decode_body()?;
        let mut target = SharedViewTarget::new(&self.registry);
        Ok(apply_section(&mut target, &body)?)
    }

    /// Recreates a share of the private views. The caller holds `W`.
    ///
    /// # Panics
    ///
    /// Panics if write intents are pending.
    pub(crate) fn remap_private_views(&self, proof: LockProof<'_>) -> Result<RemapPass, DurError> {
        self.check_proof(proof);
        assert!(
            !self.job.has_written(),
            "remapping private views with pending write intents"
        );

        let _files = self.files_lock.write();
        let started = Instant::now();
        let pass = self.remapper.remap_some(&self.registry, &self.config.remap)?;
        let micros = micros_since(started);
        self.stats.record(|s| s.remap_micros = micros);
        Ok(pass)
    }

    /// Aborts unless every private view equals its shared view.
    fn validate_all_maps_match(&self) {
        for file in self.registry.files() {
            let matches = file
                .private_matches_shared()
                .or_fatal("validating private views");
            if !matches {
                fatal(
                    "validating private views",
                    format!(
                        "written data does not match in-memory view, missing write intent? ({})",
                        file.name()
                    ),
                );
            }
        }
    }

    fn record_commit(&self, record: &CommitRecord) {
        let journaled = record.journaled.map(|w| w.bytes).unwrap_or(0);
        self.stats.record(|s| {
            s.commits = 1;
            s.journaled_bytes = journaled;
            s.uncompressed_bytes = record.uncompressed;
            s.data_file_bytes = record.applied.bytes;
            s.prep_micros = record.prep_micros;
            s.journal_micros = record.journal_micros;
            s.data_files_micros = record.data_files_micros;
        });
    }

    fn check_proof(&self, proof: LockProof<'_>) {
        assert_eq!(
            proof.lock_id(),
            self.lock.id(),
            "lock guard belongs to another durability context"
        );
    }
}
