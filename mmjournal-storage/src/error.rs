//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Wal(#[from] mmjournal_wal::WalError),

    #[error("data file already exists: {0}")]
    FileExists(String),

    #[error("data file not found: {0}")]
    FileNotFound(String),

    #[error("unknown data file id: {0}")]
    UnknownFileId(u32),

    #[error("address range {addr:#x}+{len} is not mapped")]
    AddressNotMapped { addr: u64, len: u64 },

    #[error("range {offset}+{len} is outside data file {file} of {file_len} bytes")]
    OutOfBounds {
        file: String,
        offset: u64,
        len: u64,
        file_len: u64,
    },

    #[error("invalid data file: {0}")]
    InvalidFile(String),
}
