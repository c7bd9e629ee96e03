//! # mmjournal-core
//!
//! Durability engine for mmjournal.
//!
//! This crate provides:
//! - The global lock hierarchy (`r`, `w`, `R`, `W`)
//! - Write intents and the ledger they accumulate in
//! - Group commit, from a background thread or on demand
//! - Commit epochs for durability waits
//! - Startup recovery and orderly shutdown

mod commit_thread;
pub mod commit_job;
pub mod config;
pub mod durability;
pub mod error;
pub mod fatal;
mod group_commit;
pub mod intent;
pub mod lock;
pub mod notify;
pub mod prep;
pub mod stats;

pub use commit_job::{CommitJob, JobSnapshot};
pub use config::DurabilityConfig;
pub use durability::{Durability, DurabilityStatus};
pub use error::DurError;
pub use intent::WriteIntent;
pub use lock::{
    DowngradedGuard, ExclusiveGuard, GlobalLock, GlobalReadGuard, IntentWriteGuard, LockContext,
    LockMode, LockProof, ReadGuard, UpgradedGuard, WriteLock,
};
pub use notify::{Epoch, NotifyAll};
pub use stats::{DurStats, IntervalStats, StatsSnapshot};

pub use mmjournal_storage::{FileId, ViewAddress, ViewBackend};
