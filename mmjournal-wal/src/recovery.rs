//! Journal recovery scanning.
//!
//! Walks journal files oldest to newest and hands every valid section to a
//! visitor. The walk ends at the first point where the journal stops being
//! trustworthy:
//! - A torn trailing section (partial write at a crash)
//! - A section failing its checksum or header checks
//!
//! A section that fails its checksum but is followed only by zero fill, with
//! no data in any later file, is a torn write into a preallocated file and
//! counts as truncation rather than corruption.
//!
//! Everything after that point, including later files, is discarded.

use crate::error::WalError;
use crate::journal_file::{read_sections, JournalFileId, JournalFileScanner};
use crate::section::JournalSection;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Why a scan stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScanStop {
    /// Every file ended cleanly.
    End,
    /// A partially written section ends the journal.
    Truncated { file_id: JournalFileId, offset: u64 },
    /// A section failed validation.
    Corrupt {
        file_id: JournalFileId,
        offset: u64,
        reason: String,
    },
}

/// Result of a journal scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Journal files looked at.
    pub files_scanned: usize,
    /// Sections handed to the visitor.
    pub valid_sections: u64,
    /// Range payload bytes across the valid sections.
    pub range_bytes: u64,
    /// Bytes past the stop point that were ignored (zero fill excluded).
    pub bytes_discarded: u64,
    /// Highest sequence among the valid sections.
    pub max_sequence: u64,
    pub stop: ScanStop,
    /// Whether any journal file held anything other than zeros.
    pub had_data: bool,
}

impl ScanReport {
    fn new() -> Self {
        Self {
            files_scanned: 0,
            valid_sections: 0,
            range_bytes: 0,
            bytes_discarded: 0,
            max_sequence: 0,
            stop: ScanStop::End,
            had_data: false,
        }
    }

    /// Returns whether the journal holds data but not a single usable
    /// section, which recovery refuses to start from.
    pub fn is_unrecoverable(&self) -> bool {
        self.valid_sections == 0 && matches!(self.stop, ScanStop::Corrupt { .. })
    }
}

/// Journal recovery scanner.
pub struct RecoveryScanner {
    dir: PathBuf,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Visits every valid section in order.
    ///
    /// Sequence numbers must strictly increase across the whole journal; a
    /// regression is returned as [`WalError::SequenceOutOfOrder`].
    pub fn for_each_section<E, F>(&self, mut visit: F) -> Result<ScanReport, E>
    where
        E: From<WalError>,
        F: FnMut(JournalFileId, &JournalSection) -> Result<(), E>,
    {
        let file_ids = JournalFileScanner::list_files(&self.dir)?;
        let mut report = ScanReport::new();
        let mut last_sequence: Option<u64> = None;
        let mut stopped = false;
        // Checksum failure reported as truncation until a later file shows data.
        let mut torn: Option<(JournalFileId, u64, String)> = None;

        for file_id in file_ids {
            let path = JournalFileScanner::path_of(&self.dir, file_id);
            let contents = read_sections(&path)?;
            report.files_scanned += 1;

            if !contents.sections.is_empty() || !contents.clean_tail {
                report.had_data = true;
            }

            if stopped {
                let holds_data = !contents.sections.is_empty() || !contents.clean_tail;
                let damaged = if holds_data { torn.take() } else { None };
                if let Some((torn_file, offset, reason)) = damaged {
                    tracing::warn!(
                        "Journal file {} holds data after the damaged section in file {}",
                        file_id,
                        torn_file
                    );
                    report.stop = ScanStop::Corrupt {
                        file_id: torn_file,
                        offset,
                        reason,
                    };
                }
                report.bytes_discarded += contents.end;
                if !contents.sections.is_empty() {
                    tracing::warn!(
                        "Ignoring {} sections in journal file {} after the stop point",
                        contents.sections.len(),
                        file_id
                    );
                }
                continue;
            }

            for (offset, section) in &contents.sections {
                let sequence = section.header.sequence;
                if let Some(last) = last_sequence {
                    if sequence <= last {
                        return Err(WalError::SequenceOutOfOrder { sequence, last }.into());
                    }
                }

                tracing::trace!(
                    "Recovering section {} from file {} at offset {}",
                    sequence,
                    file_id,
                    offset
                );
                visit(file_id, section)?;

                last_sequence = Some(sequence);
                report.valid_sections += 1;
                report.range_bytes += section.body.range_bytes();
                report.max_sequence = report.max_sequence.max(sequence);
            }

            if let (Some(err), true) = (&contents.error, contents.torn_tail) {
                tracing::info!(
                    "Journal file {} ends in a torn section at offset {}: {}",
                    file_id,
                    contents.end,
                    err
                );
                report.bytes_discarded += contents.len - contents.end;
                report.stop = ScanStop::Truncated {
                    file_id,
                    offset: contents.end,
                };
                torn = Some((file_id, contents.end, err.to_string()));
                stopped = true;
            } else if let Some(err) = &contents.error {
                tracing::warn!(
                    "Journal file {} is corrupt at offset {}: {}",
                    file_id,
                    contents.end,
                    err
                );
                report.bytes_discarded += contents.len - contents.end;
                report.stop = ScanStop::Corrupt {
                    file_id,
                    offset: contents.end,
                    reason: err.to_string(),
                };
                stopped = true;
            } else if !contents.clean_tail {
                tracing::info!(
                    "Journal file {} ends in a partial section at offset {}",
                    file_id,
                    contents.end
                );
                report.bytes_discarded += contents.len - contents.end;
                report.stop = ScanStop::Truncated {
                    file_id,
                    offset: contents.end,
                };
                stopped = true;
            }
        }

        Ok(report)
    }

    /// Scans the journal without acting on the sections.
    pub fn scan(&self) -> Result<ScanReport, WalError> {
        self.for_each_section(|_, _| Ok::<(), WalError>(()))
    }
}

/// Verifies journal integrity without modifying anything.
pub fn verify_journal(dir: impl AsRef<Path>) -> Result<ScanReport, WalError> {
    RecoveryScanner::new(dir).scan()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal_file::JournalFile;
    use crate::section::{SectionFile, SectionWriter};
    use std::io::Write;
    use tempfile::TempDir;

    fn encoded(sequence: u64) -> bytes::Bytes {
        let files = vec![SectionFile {
            file_id: 1,
            name: "data.0".to_string(),
        }];
        let mut writer = SectionWriter::new(&files, &[]).unwrap();
        writer.push_range(0, 0, &[sequence as u8; 32]);
        writer.finish(sequence, 0).encode(None).unwrap()
    }

    fn write_file(dir: &Path, id: JournalFileId, sequences: &[u64], preallocate: bool) {
        let mut file = JournalFile::create(dir, id, 64 * 1024, preallocate).unwrap();
        for &seq in sequences {
            file.append(&encoded(seq)).unwrap();
        }
        file.sync().unwrap();
    }

    #[test]
    fn test_scan_empty_directory() {
        let dir = TempDir::new().unwrap();
        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.files_scanned, 0);
        assert_eq!(report.valid_sections, 0);
        assert_eq!(report.stop, ScanStop::End);
        assert!(!report.had_data);
        assert!(!report.is_unrecoverable());
    }

    #[test]
    fn test_scan_missing_directory() {
        let dir = TempDir::new().unwrap();
        let report = verify_journal(dir.path().join("journal")).unwrap();
        assert_eq!(report.files_scanned, 0);
    }

    #[test]
    fn test_scan_empty_and_preallocated_files() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[], false);
        write_file(dir.path(), 2, &[], true);

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.valid_sections, 0);
        assert_eq!(report.stop, ScanStop::End);
        assert!(!report.had_data);
    }

    #[test]
    fn test_scan_clean_journal_across_files() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1, 2], true);
        write_file(dir.path(), 2, &[3, 4, 5], false);

        let mut seen = Vec::new();
        let report = RecoveryScanner::new(dir.path())
            .for_each_section(|file_id, section| {
                seen.push((file_id, section.header.sequence));
                Ok::<(), WalError>(())
            })
            .unwrap();

        assert_eq!(seen, vec![(1, 1), (1, 2), (2, 3), (2, 4), (2, 5)]);
        assert_eq!(report.valid_sections, 5);
        assert_eq!(report.max_sequence, 5);
        assert_eq!(report.range_bytes, 5 * 32);
        assert_eq!(report.stop, ScanStop::End);
        assert!(report.had_data);
    }

    #[test]
    fn test_scan_stops_at_torn_section() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1, 2, 3], false);
        let torn = encoded(4);
        {
            let path = JournalFileScanner::path_of(dir.path(), 1);
            let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
            file.write_all(&torn[..torn.len() - 5]).unwrap();
        }
        write_file(dir.path(), 2, &[5], false);

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.valid_sections, 3);
        assert_eq!(report.max_sequence, 3);
        assert!(matches!(report.stop, ScanStop::Truncated { file_id: 1, .. }));
        assert!(report.bytes_discarded > 0);
        assert!(!report.is_unrecoverable());
    }

    #[test]
    fn test_scan_stops_at_corrupt_section() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1, 2], false);
        {
            let path = JournalFileScanner::path_of(dir.path(), 1);
            let mut data = std::fs::read(&path).unwrap();
            let last = data.len() - 1;
            data[last] ^= 0xFF;
            std::fs::write(&path, data).unwrap();
        }

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.valid_sections, 1);
        assert!(matches!(report.stop, ScanStop::Corrupt { file_id: 1, .. }));
        assert!(!report.is_unrecoverable());
    }

    fn zero_from(dir: &Path, id: JournalFileId, from: usize) {
        let path = JournalFileScanner::path_of(dir, id);
        let mut data = std::fs::read(&path).unwrap();
        data[from..].fill(0);
        std::fs::write(&path, data).unwrap();
    }

    #[test]
    fn test_torn_only_section_in_preallocated_journal_is_truncation() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1], true);
        zero_from(dir.path(), 1, encoded(1).len() / 2);

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.valid_sections, 0);
        assert_eq!(
            report.stop,
            ScanStop::Truncated {
                file_id: 1,
                offset: 0
            }
        );
        assert!(report.had_data);
        assert!(!report.is_unrecoverable());
    }

    #[test]
    fn test_torn_section_after_valid_ones_keeps_the_prefix() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1, 2, 3], true);
        let section = encoded(1).len();
        zero_from(dir.path(), 1, 2 * section + section / 2);

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.valid_sections, 2);
        assert_eq!(report.max_sequence, 2);
        assert!(matches!(report.stop, ScanStop::Truncated { file_id: 1, .. }));
    }

    #[test]
    fn test_zero_tailed_damage_with_later_data_is_corruption() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1], true);
        zero_from(dir.path(), 1, encoded(1).len() / 2);
        write_file(dir.path(), 2, &[], true);
        write_file(dir.path(), 3, &[2], false);

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.valid_sections, 0);
        assert!(matches!(
            report.stop,
            ScanStop::Corrupt {
                file_id: 1,
                offset: 0,
                ..
            }
        ));
        assert!(report.is_unrecoverable());
    }

    #[test]
    fn test_garbage_only_journal_is_unrecoverable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            JournalFileScanner::path_of(dir.path(), 1),
            vec![0x5Au8; 4096],
        )
        .unwrap();

        let report = verify_journal(dir.path()).unwrap();
        assert_eq!(report.valid_sections, 0);
        assert!(report.had_data);
        assert!(report.is_unrecoverable());
    }

    #[test]
    fn test_scan_rejects_sequence_regression() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[4, 5], false);
        write_file(dir.path(), 2, &[3], false);

        let result = verify_journal(dir.path());
        assert!(matches!(
            result,
            Err(WalError::SequenceOutOfOrder {
                sequence: 3,
                last: 5
            })
        ));
    }

    #[test]
    fn test_visitor_error_propagates() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, &[1, 2], false);

        let mut calls = 0;
        let result = RecoveryScanner::new(dir.path()).for_each_section(|_, _| {
            calls += 1;
            Err(WalError::InvalidState("stop".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
