//! # mmjournal-wal
//!
//! On-disk journal for mmjournal.
//!
//! This crate provides the sequential write-ahead journal with:
//! - Checksummed sections, one per group commit
//! - Optional zstd compression of section bodies
//! - Size-based rotation across preallocated journal files
//! - A recovery scanner that stops at the first torn section

pub mod error;
pub mod journal;
pub mod journal_file;
pub mod recovery;
pub mod section;

pub use error::WalError;
pub use journal::{remove_journal_files, Journal, JournalConfig, JournalStats, JournalWrite};
pub use journal_file::{read_sections, FileContents, JournalFile, JournalFileId, JournalFileScanner};
pub use recovery::{verify_journal, RecoveryScanner, ScanReport, ScanStop};
pub use section::{
    DurableOp, JournalSection, PreparedSection, RangeRecord, SectionBody, SectionFile,
    SectionHeader, SectionWriter,
};

/// Default journal file size limit before rotation (1 GiB).
pub const DEFAULT_JOURNAL_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Section header size in bytes.
pub const SECTION_HEADER_SIZE: usize = 36;

/// Default zstd level for section bodies.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 1;
