//! Journal replay into the data directory.
//!
//! Recovery runs before any data file is opened, so replay writes straight
//! to the files by name. Files named by a section are created or extended
//! as needed before bytes land in them.

use crate::apply::{apply_section, ApplyStats, SectionTarget};
use crate::error::StorageError;
use crate::registry::data_file_path;
use mmjournal_wal::{DurableOp, RecoveryScanner, ScanReport, SectionFile};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File-level effects of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub files_touched: u64,
    pub files_created: u64,
    pub files_extended: u64,
}

/// Applies sections to the files of a data directory.
pub struct DataDirTarget {
    dir: PathBuf,
    open: HashMap<String, File>,
    stats: ReplayStats,
}

impl DataDirTarget {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: HashMap::new(),
            stats: ReplayStats::default(),
        }
    }

    /// Opens `name`, creating it and growing it to at least `min_len`.
    fn file_for(&mut self, name: &str, min_len: u64) -> Result<&mut File, StorageError> {
        if !self.open.contains_key(name) {
            let path = data_file_path(&self.dir, name)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let existed = path.exists();
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            if !existed {
                tracing::info!("Recovery created data file {}", name);
                self.stats.files_created += 1;
            }
            self.stats.files_touched += 1;
            self.open.insert(name.to_string(), file);
        }

        let file = self
            .open
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        let len = file.metadata()?.len();
        if len < min_len {
            tracing::debug!("Recovery extending {} from {} to {} bytes", name, len, min_len);
            file.set_len(min_len)?;
            self.stats.files_extended += 1;
        }
        Ok(file)
    }

    /// Syncs every touched file and returns the replay statistics.
    pub fn finish(self) -> Result<ReplayStats, StorageError> {
        for file in self.open.values() {
            file.sync_all()?;
        }
        Ok(self.stats)
    }
}

impl SectionTarget for DataDirTarget {
    fn apply_op(&mut self, op: &DurableOp) -> Result<(), StorageError> {
        match op {
            DurableOp::FileCreated { name, len } => {
                self.file_for(name, *len)?;
            }
        }
        Ok(())
    }

    fn apply_range(
        &mut self,
        file: &SectionFile,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let handle = self.file_for(&file.name, offset + data.len() as u64)?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(data)?;
        Ok(())
    }
}

/// Outcome of replaying a journal directory.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub report: ScanReport,
    pub applied: ApplyStats,
    pub files: ReplayStats,
}

/// Replays every valid section in `journal_dir` into `data_dir`.
pub fn replay_journal(journal_dir: &Path, data_dir: &Path) -> Result<ReplayOutcome, StorageError> {
    let mut target = DataDirTarget::new(data_dir);
    let mut applied = ApplyStats::default();

    let report = RecoveryScanner::new(journal_dir).for_each_section(|_, section| {
        let stats = apply_section(&mut target, &section.body)?;
        applied.merge(stats);
        Ok::<(), StorageError>(())
    })?;

    let files = target.finish()?;
    Ok(ReplayOutcome {
        report,
        applied,
        files,
    })
}
