//! Journal writer.
//!
//! A single writer appends prepared sections in strictly increasing sequence
//! order. Every append is forced to stable storage before it returns.

use crate::error::WalError;
use crate::journal_file::{JournalFile, JournalFileId, JournalFileScanner};
use crate::section::PreparedSection;
use crate::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_JOURNAL_FILE_SIZE};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Journal configuration.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the journal files.
    pub dir: PathBuf,
    /// File size limit before rotation.
    pub max_file_size: u64,
    /// zstd level for section bodies, `None` to store them raw.
    pub compression_level: Option<i32>,
    /// Extend new journal files to `max_file_size` with zeros up front.
    pub preallocate: bool,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: DEFAULT_JOURNAL_FILE_SIZE,
            compression_level: Some(DEFAULT_COMPRESSION_LEVEL),
            preallocate: false,
        }
    }

    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn with_compression(mut self, level: Option<i32>) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = preallocate;
        self
    }
}

/// Where and how large a journaled section ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalWrite {
    pub file_id: JournalFileId,
    pub offset: u64,
    /// Bytes written to disk, header included.
    pub bytes: u64,
}

/// Cumulative I/O statistics for the journal.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JournalStats {
    pub sections_written: u64,
    /// Bytes written to journal files, after compression.
    pub bytes_written: u64,
    /// Section body bytes before compression.
    pub uncompressed_bytes: u64,
    pub fsyncs: u64,
    pub rotations: u64,
    pub files_removed: u64,
}

/// The append-only journal.
pub struct Journal {
    config: JournalConfig,
    current: Mutex<Option<JournalFile>>,
    /// Journal files on disk, oldest first.
    files: Mutex<BTreeSet<JournalFileId>>,
    /// Next sequence handed out to a section builder.
    next_sequence: AtomicU64,
    /// Sequence of the last section written.
    last_written: AtomicU64,
    closed: AtomicBool,
    stats_sections: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_uncompressed: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_rotations: AtomicU64,
    stats_removed: AtomicU64,
}

impl Journal {
    /// Opens the journal for writing, starting a fresh file after any
    /// existing ones. Sections written from now on are numbered after
    /// `last_sequence`.
    ///
    /// Recovery must already have consumed the existing files.
    pub fn open(config: JournalConfig, last_sequence: u64) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.dir)?;
        let existing = JournalFileScanner::list_files(&config.dir)?;

        let journal = Self {
            config,
            current: Mutex::new(None),
            files: Mutex::new(existing.into_iter().collect()),
            next_sequence: AtomicU64::new(last_sequence + 1),
            last_written: AtomicU64::new(last_sequence),
            closed: AtomicBool::new(false),
            stats_sections: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_uncompressed: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_rotations: AtomicU64::new(0),
            stats_removed: AtomicU64::new(0),
        };

        {
            let mut current = journal.current.lock();
            journal.rotate(&mut current)?;
        }

        tracing::info!(
            "Journal opened at {} (next_sequence={})",
            journal.config.dir.display(),
            last_sequence + 1
        );

        Ok(journal)
    }

    /// Returns the journal configuration.
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Hands out the sequence number for the next section.
    pub fn reserve_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the sequence of the last section written.
    pub fn last_written(&self) -> u64 {
        self.last_written.load(Ordering::SeqCst)
    }

    /// Replaces the active file with a new one. The old file is synced first.
    fn rotate(&self, current: &mut Option<JournalFile>) -> Result<(), WalError> {
        if let Some(mut old) = current.take() {
            old.sync()?;
        }

        let mut files = self.files.lock();
        let next_id = files.iter().next_back().map(|&id| id + 1).unwrap_or(1);
        let file = JournalFile::create(
            &self.config.dir,
            next_id,
            self.config.max_file_size,
            self.config.preallocate,
        )?;
        sync_dir(&self.config.dir)?;
        files.insert(next_id);
        *current = Some(file);

        self.stats_rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Rotated to journal file {}", next_id);
        Ok(())
    }

    /// Appends a section and forces it to stable storage.
    pub fn append(&self, section: &PreparedSection) -> Result<JournalWrite, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let encoded = section.encode(self.config.compression_level)?;

        let mut current = self.current.lock();
        let last = self.last_written.load(Ordering::SeqCst);
        if section.sequence <= last {
            return Err(WalError::SequenceOutOfOrder {
                sequence: section.sequence,
                last,
            });
        }

        let needs_rotation = match current.as_ref() {
            Some(file) => !file.can_fit(encoded.len()),
            None => true,
        };
        if needs_rotation {
            self.rotate(&mut current)?;
        }

        let file = current
            .as_mut()
            .ok_or_else(|| WalError::InvalidState("no active journal file".to_string()))?;
        let file_id = file.id();
        let offset = file.append(&encoded)?;
        file.sync()?;

        self.last_written.store(section.sequence, Ordering::SeqCst);
        self.stats_sections.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        self.stats_uncompressed
            .fetch_add(section.body.len() as u64, Ordering::Relaxed);
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            "Journaled section {} ({} bytes) to file {} at offset {}",
            section.sequence,
            encoded.len(),
            file_id,
            offset
        );

        Ok(JournalWrite {
            file_id,
            offset,
            bytes: encoded.len() as u64,
        })
    }

    /// Forces the active file to stable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut current = self.current.lock();
        if let Some(file) = current.as_mut() {
            file.sync()?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Deletes journal files older than the active one.
    ///
    /// Only valid once every section in those files has been applied to the
    /// data files and the data files flushed. Returns the number deleted.
    pub fn remove_files_before_current(&self) -> Result<usize, WalError> {
        let current_id = match self.current.lock().as_ref() {
            Some(file) => file.id(),
            None => return Ok(0),
        };
        self.remove_files_before(current_id)
    }

    /// Starts a fresh file and deletes every older one.
    ///
    /// Only valid once all journaled sections have been applied and the
    /// data files flushed.
    pub fn truncate(&self) -> Result<usize, WalError> {
        let current_id = {
            let mut current = self.current.lock();
            let in_use = current.as_ref().map(|f| f.position() > 0).unwrap_or(true);
            if in_use {
                self.rotate(&mut current)?;
            }
            current.as_ref().map(|f| f.id()).unwrap_or(0)
        };
        self.remove_files_before(current_id)
    }

    fn remove_files_before(&self, id: JournalFileId) -> Result<usize, WalError> {
        let to_remove: Vec<JournalFileId> = {
            let files = self.files.lock();
            files.range(..id).copied().collect()
        };

        if to_remove.is_empty() {
            return Ok(0);
        }

        for file_id in &to_remove {
            let path = JournalFileScanner::path_of(&self.config.dir, *file_id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.files.lock().remove(file_id);
            tracing::debug!("Removed journal file {}", file_id);
        }
        sync_dir(&self.config.dir)?;

        self.stats_removed
            .fetch_add(to_remove.len() as u64, Ordering::Relaxed);
        Ok(to_remove.len())
    }

    /// Returns the IDs of the journal files on disk.
    pub fn file_ids(&self) -> Vec<JournalFileId> {
        self.files.lock().iter().copied().collect()
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> JournalStats {
        JournalStats {
            sections_written: self.stats_sections.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            uncompressed_bytes: self.stats_uncompressed.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            rotations: self.stats_rotations.load(Ordering::Relaxed),
            files_removed: self.stats_removed.load(Ordering::Relaxed),
        }
    }

    /// Closes the journal. Later appends fail with [`WalError::Closed`].
    pub fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }
}

/// Deletes every journal file in `dir`. Returns the number deleted.
pub fn remove_journal_files(dir: &Path) -> Result<usize, WalError> {
    let ids = JournalFileScanner::list_files(dir)?;
    for id in &ids {
        std::fs::remove_file(JournalFileScanner::path_of(dir, *id))?;
    }
    if !ids.is_empty() {
        sync_dir(dir)?;
    }
    Ok(ids.len())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), WalError> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), WalError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal_file::read_sections;
    use crate::section::{DurableOp, SectionFile, SectionWriter};
    use tempfile::TempDir;

    fn section(journal: &Journal, payload_len: usize) -> PreparedSection {
        let files = vec![SectionFile {
            file_id: 1,
            name: "data.0".to_string(),
        }];
        let mut writer = SectionWriter::new(&files, &[]).unwrap();
        writer.push_range(0, 0, &vec![7u8; payload_len]);
        writer.finish(journal.reserve_sequence(), 0)
    }

    #[test]
    fn test_journal_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(JournalConfig::new(dir.path()), 0).unwrap();
        assert_eq!(journal.file_ids(), vec![1]);
        assert_eq!(journal.last_written(), 0);
    }

    #[test]
    fn test_journal_append_and_read() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(JournalConfig::new(dir.path()), 0).unwrap();

        for _ in 0..3 {
            let s = section(&journal, 100);
            journal.append(&s).unwrap();
        }
        assert_eq!(journal.last_written(), 3);

        let stats = journal.stats();
        assert_eq!(stats.sections_written, 3);
        assert!(stats.fsyncs >= 3);

        let path = JournalFileScanner::path_of(dir.path(), 1);
        let contents = read_sections(&path).unwrap();
        assert!(contents.error.is_none());
        let seqs: Vec<u64> = contents
            .sections
            .iter()
            .map(|(_, s)| s.header.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_journal_rejects_out_of_order_sequence() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(JournalConfig::new(dir.path()), 0).unwrap();

        let first = section(&journal, 10);
        let second = section(&journal, 10);
        journal.append(&second).unwrap();

        let result = journal.append(&first);
        assert!(matches!(
            result,
            Err(WalError::SequenceOutOfOrder {
                sequence: 1,
                last: 2
            })
        ));
    }

    #[test]
    fn test_journal_rotation() {
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new(dir.path())
            .with_max_file_size(300)
            .with_compression(None);
        let journal = Journal::open(config, 0).unwrap();

        for _ in 0..4 {
            let s = section(&journal, 200);
            journal.append(&s).unwrap();
        }

        assert_eq!(journal.file_ids().len(), 4);
        assert!(journal.stats().rotations >= 4);
    }

    #[test]
    fn test_journal_sequences_continue_after_reopen() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(JournalConfig::new(dir.path()), 41).unwrap();
        let s = section(&journal, 10);
        assert_eq!(s.sequence, 42);
        journal.append(&s).unwrap();
        assert_eq!(journal.last_written(), 42);
    }

    #[test]
    fn test_journal_truncate_removes_old_files() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(JournalConfig::new(dir.path()), 0).unwrap();
        let s = section(&journal, 10);
        journal.append(&s).unwrap();

        let removed = journal.truncate().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(journal.file_ids(), vec![2]);
        assert_eq!(
            JournalFileScanner::list_files(dir.path()).unwrap(),
            vec![2]
        );

        // Truncating an unused active file keeps it.
        assert_eq!(journal.truncate().unwrap(), 0);
        assert_eq!(journal.file_ids(), vec![2]);
    }

    #[test]
    fn test_remove_files_before_current() {
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new(dir.path())
            .with_max_file_size(200)
            .with_compression(None);
        let journal = Journal::open(config, 0).unwrap();
        for _ in 0..3 {
            let s = section(&journal, 150);
            journal.append(&s).unwrap();
        }

        let before = journal.file_ids();
        let removed = journal.remove_files_before_current().unwrap();
        assert_eq!(removed, before.len() - 1);
        assert_eq!(journal.file_ids(), vec![*before.last().unwrap()]);
    }

    #[test]
    fn test_journal_closed() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(JournalConfig::new(dir.path()), 0).unwrap();
        journal.close().unwrap();
        let s = section(&journal, 10);
        assert!(matches!(journal.append(&s), Err(WalError::Closed)));
    }

    #[test]
    fn test_preallocated_journal() {
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new(dir.path())
            .with_max_file_size(64 * 1024)
            .with_preallocate(true);
        let journal = Journal::open(config, 0).unwrap();

        let ops = vec![DurableOp::FileCreated {
            name: "data.0".to_string(),
            len: 4096,
        }];
        let s = SectionWriter::new(&[], &ops)
            .unwrap()
            .finish(journal.reserve_sequence(), 0);
        journal.append(&s).unwrap();

        let path = JournalFileScanner::path_of(dir.path(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * 1024);
        let contents = read_sections(&path).unwrap();
        assert_eq!(contents.sections.len(), 1);
        assert!(contents.clean_tail);
    }

    #[test]
    fn test_remove_journal_files() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(JournalConfig::new(dir.path()), 0).unwrap();
            let s = section(&journal, 10);
            journal.append(&s).unwrap();
        }
        assert_eq!(remove_journal_files(dir.path()).unwrap(), 1);
        assert!(JournalFileScanner::list_files(dir.path()).unwrap().is_empty());
    }
}
