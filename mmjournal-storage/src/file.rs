//! Durable data files.

use crate::error::StorageError;
use crate::view::MappedFile;
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime identifier of an open data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An address in the private view space.
///
/// Every open data file occupies `[base, base + len)` of one flat address
/// space, so a write intent can be declared without naming its file.
/// Address zero is never mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewAddress(pub u64);

impl ViewAddress {
    pub fn offset(self, by: u64) -> ViewAddress {
        ViewAddress(self.0 + by)
    }
}

impl fmt::Display for ViewAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An open data file and its view pair.
pub struct DurableFile {
    id: FileId,
    name: String,
    path: PathBuf,
    base: ViewAddress,
    len: u64,
    view: RwLock<Box<dyn MappedFile>>,
    /// Set when the private view has diverged since its last remap.
    dirty_private: AtomicBool,
}

impl DurableFile {
    pub(crate) fn new(
        id: FileId,
        name: String,
        path: PathBuf,
        base: ViewAddress,
        view: Box<dyn MappedFile>,
    ) -> Self {
        let len = view.len();
        Self {
            id,
            name,
            path,
            base,
            len,
            view: RwLock::new(view),
            dirty_private: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    /// File name relative to the data directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First address of this file in the private view space.
    pub fn base(&self) -> ViewAddress {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether `addr` falls inside this file.
    pub fn contains(&self, addr: ViewAddress) -> bool {
        addr >= self.base && addr.0 < self.base.0 + self.len
    }

    fn named(&self, err: StorageError) -> StorageError {
        match err {
            StorageError::OutOfBounds {
                offset,
                len,
                file_len,
                ..
            } => StorageError::OutOfBounds {
                file: self.name.clone(),
                offset,
                len,
                file_len,
            },
            other => other,
        }
    }

    pub fn read_private(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.view
            .read()
            .read_private(offset, buf)
            .map_err(|e| self.named(e))
    }

    pub fn write_private(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.view
            .write()
            .write_private(offset, data)
            .map_err(|e| self.named(e))?;
        self.dirty_private.store(true, Ordering::Release);
        Ok(())
    }

    pub fn read_shared(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.view
            .read()
            .read_shared(offset, buf)
            .map_err(|e| self.named(e))
    }

    pub fn write_shared(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.view
            .write()
            .write_shared(offset, data)
            .map_err(|e| self.named(e))
    }

    /// Returns whether the private view changed since its last remap.
    pub fn needs_remap(&self) -> bool {
        self.dirty_private.load(Ordering::Acquire)
    }

    /// Recreates the private view from the shared view.
    pub fn remap_private(&self) -> Result<(), StorageError> {
        self.view.write().remap_private()?;
        self.dirty_private.store(false, Ordering::Release);
        Ok(())
    }

    /// Forces the shared view to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.view.read().flush()
    }

    pub fn private_matches_shared(&self) -> Result<bool, StorageError> {
        self.view.read().private_matches_shared()
    }
}

impl fmt::Debug for DurableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
