//! Durability error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the durability engine.
#[derive(Debug, Error)]
pub enum DurError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Wal(#[from] mmjournal_wal::WalError),

    #[error("storage error: {0}")]
    Storage(#[from] mmjournal_storage::StorageError),

    #[error("journal at {dir} holds no recoverable section: {reason}")]
    UnrecoverableJournal { dir: PathBuf, reason: String },

    #[error("durability has not been started")]
    NotStarted,

    #[error("durability is already started")]
    AlreadyStarted,

    #[error("durability has been shut down")]
    ShutDown,

    #[error("invalid durability state: {0}")]
    InvalidState(String),
}

impl DurError {
    /// Returns whether the operator has to intervene before the store can
    /// start.
    pub fn needs_operator(&self) -> bool {
        matches!(self, DurError::UnrecoverableJournal { .. })
    }
}
