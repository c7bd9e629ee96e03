//! Applying journal sections to data files.
//!
//! The same walk is used at runtime, against the shared views of the open
//! files, and during recovery, against the files in the data directory.
//! Applying a section only copies bytes to fixed offsets, so applying it
//! again yields the same file contents.

use crate::error::StorageError;
use crate::file::FileId;
use crate::registry::FileRegistry;
use mmjournal_wal::{DurableOp, SectionBody, SectionFile};

/// Where a section's effects are written.
pub trait SectionTarget {
    fn apply_op(&mut self, op: &DurableOp) -> Result<(), StorageError>;

    fn apply_range(
        &mut self,
        file: &SectionFile,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError>;
}

/// What applying a section did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub ops: u64,
    pub ranges: u64,
    pub bytes: u64,
}

impl ApplyStats {
    pub fn merge(&mut self, other: ApplyStats) {
        self.ops += other.ops;
        self.ranges += other.ranges;
        self.bytes += other.bytes;
    }
}

/// Applies a section: durable operations first, then every range in order.
pub fn apply_section<T>(target: &mut T, body: &SectionBody) -> Result<ApplyStats, StorageError>
where
    T: SectionTarget + ?Sized,
{
    let mut stats = ApplyStats::default();

    for op in &body.ops {
        target.apply_op(op)?;
        stats.ops += 1;
    }

    for range in &body.ranges {
        let file = body.file_of(range);
        target.apply_range(file, range.offset, &range.data)?;
        stats.ranges += 1;
        stats.bytes += range.data.len() as u64;
    }

    Ok(stats)
}

/// Writes sections into the shared views of open files.
pub struct SharedViewTarget<'a> {
    registry: &'a FileRegistry,
}

impl<'a> SharedViewTarget<'a> {
    pub fn new(registry: &'a FileRegistry) -> Self {
        Self { registry }
    }
}

impl SectionTarget for SharedViewTarget<'_> {
    fn apply_op(&mut self, op: &DurableOp) -> Result<(), StorageError> {
        // Files are created before their creation is journaled.
        match op {
            DurableOp::FileCreated { name, .. } => {
                if self.registry.find(name).is_none() {
                    tracing::debug!("Created file {} is no longer open", name);
                }
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
        let durable = self
            .registry
            .get(FileId(file.file_id))
            .ok_or(StorageError::UnknownFileId(file.file_id))?;
        durable.write_shared(offset, data)
    }
}
