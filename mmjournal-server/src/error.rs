//! Server error types.

use thiserror::Error;

/// Errors from the process layer.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("durability error: {0}")]
    Durability(#[from] mmjournal_core::DurError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Returns whether the process must not be restarted without an operator.
    pub fn needs_operator(&self) -> bool {
        match self {
            ServerError::Durability(e) => e.needs_operator(),
            _ => false,
        }
    }
}
