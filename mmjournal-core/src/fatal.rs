//! Process-ending failures.
//!
//! Once a commit has started changing the journal or the data files, a
//! failure leaves the ledger and the views in a state nothing in-process can
//! reason about. The process aborts and recovery replays the journal on the
//! next start.

use std::fmt::Display;

/// Logs `err` and aborts the process.
#[cold]
pub fn fatal(context: &str, err: impl Display) -> ! {
    tracing::error!("Fatal durability failure in {}: {}", context, err);
    eprintln!("fatal durability failure in {}: {}", context, err);
    std::process::abort()
}

/// Unwraps a commit step, aborting on failure.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self, context: &str) -> T;
}

impl<T, E: Display> OrFatal<T> for Result<T, E> {
    fn or_fatal(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(context, err),
        }
    }
}
