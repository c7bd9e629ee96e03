//! # mmjournal-storage
//!
//! Data file layer for mmjournal.
//!
//! This crate provides:
//! - Private/shared view pairs, memory-mapped or buffered
//! - The registry of open data files and their view address space
//! - Applying journal sections to shared views
//! - Round-robin remapping of private views
//! - Replaying a journal directory into the data files

pub mod apply;
pub mod error;
pub mod file;
pub mod registry;
pub mod remap;
pub mod replay;
pub mod view;

pub use apply::{apply_section, ApplyStats, SectionTarget, SharedViewTarget};
pub use error::StorageError;
pub use file::{DurableFile, FileId, ViewAddress};
pub use registry::{FileRegistry, MappedRange, BASE_ADDRESS};
pub use remap::{RemapPass, RemapPolicy, Remapper};
pub use replay::{replay_journal, DataDirTarget, ReplayOutcome, ReplayStats};
pub use view::{BufferedFile, MappedFile, MmapFile, ViewBackend};
