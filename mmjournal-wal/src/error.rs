//! Journal error types.

use thiserror::Error;

/// Errors that can occur while writing or reading the journal.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("section corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedSection {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid section header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("malformed section body: {0}")]
    MalformedBody(String),

    #[error("section too large: {size} bytes (max {max})")]
    SectionTooLarge { size: usize, max: usize },

    #[error("section sequence {sequence} is not after last written sequence {last}")]
    SequenceOutOfOrder { sequence: u64, last: u64 },

    #[error("compression error: {0}")]
    Compression(String),

    #[error("journal is closed")]
    Closed,

    #[error("invalid journal state: {0}")]
    InvalidState(String),
}

impl WalError {
    /// Returns whether this error marks the end of the usable journal during a
    /// recovery scan (a torn or corrupt trailing section) rather than an I/O
    /// failure.
    pub fn is_crash_artifact(&self) -> bool {
        matches!(
            self,
            WalError::CorruptedSection { .. }
                | WalError::InvalidHeader { .. }
                | WalError::MalformedBody(_)
                | WalError::SectionTooLarge { .. }
                | WalError::Compression(_)
        )
    }
}
