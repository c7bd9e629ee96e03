//! Private/shared view pairs over a data file.
//!
//! Every data file is seen through two views:
//! - The private view absorbs in-process writes and is never written back
//!   to the file by itself.
//! - The shared view is the file's authoritative content. Only the applier
//!   writes to it.
//!
//! `remap_private` throws away the private view's changes and re-reads it
//! from the shared view.

use crate::error::StorageError;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Which view implementation backs the data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewBackend {
    /// A shared mapping plus a copy-on-write private mapping.
    #[default]
    Mmap,
    /// A heap copy as the private view and plain file I/O as the shared one.
    Buffered,
}

impl ViewBackend {
    /// Opens a view pair over `file` using this backend.
    pub fn open(self, file: File, len: u64) -> Result<Box<dyn MappedFile>, StorageError> {
        match self {
            ViewBackend::Mmap => Ok(Box::new(MmapFile::open(file, len)?)),
            ViewBackend::Buffered => Ok(Box::new(BufferedFile::open(file, len)?)),
        }
    }
}

impl std::str::FromStr for ViewBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mmap" => Ok(ViewBackend::Mmap),
            "buffered" => Ok(ViewBackend::Buffered),
            other => Err(format!("unknown view backend: {}", other)),
        }
    }
}

/// A data file's private and shared views.
pub trait MappedFile: Send + Sync {
    /// Length of both views in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_private(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write_private(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn read_shared(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write_shared(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Recreates the private view from the shared view.
    fn remap_private(&mut self) -> Result<(), StorageError>;

    /// Forces the shared view to stable storage.
    fn flush(&self) -> Result<(), StorageError>;

    /// Returns whether the two views hold identical bytes.
    fn private_matches_shared(&self) -> Result<bool, StorageError>;

    fn backend(&self) -> ViewBackend;
}

fn check_bounds(offset: u64, len: usize, file_len: u64) -> Result<(usize, usize), StorageError> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= file_len => Ok((offset as usize, end as usize)),
        _ => Err(StorageError::OutOfBounds {
            file: String::new(),
            offset,
            len: len as u64,
            file_len,
        }),
    }
}

/// Memory-mapped view pair.
pub struct MmapFile {
    file: File,
    len: u64,
    shared: MmapMut,
    private: MmapMut,
}

impl MmapFile {
    /// Maps the first `len` bytes of `file` twice.
    pub fn open(file: File, len: u64) -> Result<Self, StorageError> {
        if len == 0 {
            return Err(StorageError::InvalidFile(
                "cannot map an empty data file".to_string(),
            ));
        }
        let shared = Self::map_shared(&file, len)?;
        let private = Self::map_private(&file, len)?;
        Ok(Self {
            file,
            len,
            shared,
            private,
        })
    }

    fn map_shared(file: &File, len: u64) -> Result<MmapMut, StorageError> {
        // SAFETY: the file stays open for the lifetime of the mapping and data
        // files are not modified by other processes while the store runs.
        let map = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
        Ok(map)
    }

    fn map_private(file: &File, len: u64) -> Result<MmapMut, StorageError> {
        // SAFETY: as for the shared map; a copy-on-write map never writes to
        // the file.
        let map = unsafe { MmapOptions::new().len(len as usize).map_copy(file)? };
        Ok(map)
    }
}

impl MappedFile for MmapFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_private(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let (start, end) = check_bounds(offset, buf.len(), self.len)?;
        buf.copy_from_slice(&self.private[start..end]);
        Ok(())
    }

    fn write_private(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let (start, end) = check_bounds(offset, data.len(), self.len)?;
        self.private[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_shared(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let (start, end) = check_bounds(offset, buf.len(), self.len)?;
        buf.copy_from_slice(&self.shared[start..end]);
        Ok(())
    }

    fn write_shared(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let (start, end) = check_bounds(offset, data.len(), self.len)?;
        self.shared[start..end].copy_from_slice(data);
        Ok(())
    }

    fn remap_private(&mut self) -> Result<(), StorageError> {
        self.private = Self::map_private(&self.file, self.len)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.shared.flush()?;
        Ok(())
    }

    fn private_matches_shared(&self) -> Result<bool, StorageError> {
        Ok(self.private[..] == self.shared[..])
    }

    fn backend(&self) -> ViewBackend {
        ViewBackend::Mmap
    }
}

/// View pair without memory mapping: the private view is a heap copy and
/// the shared view is the file itself.
pub struct BufferedFile {
    file: Mutex<File>,
    len: u64,
    private: Vec<u8>,
}

impl BufferedFile {
    pub fn open(file: File, len: u64) -> Result<Self, StorageError> {
        let private = read_file_prefix(&file, len)?;
        Ok(Self {
            file: Mutex::new(file),
            len,
            private,
        })
    }
}

fn read_file_prefix(mut file: &File, len: u64) -> Result<Vec<u8>, StorageError> {
    let mut data = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut data)?;
    Ok(data)
}

impl MappedFile for BufferedFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_private(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let (start, end) = check_bounds(offset, buf.len(), self.len)?;
        buf.copy_from_slice(&self.private[start..end]);
        Ok(())
    }

    fn write_private(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let (start, end) = check_bounds(offset, data.len(), self.len)?;
        self.private[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_shared(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(offset, buf.len(), self.len)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_shared(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len(), self.len)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn remap_private(&mut self) -> Result<(), StorageError> {
        let file = self.file.lock();
        self.private = read_file_prefix(&file, self.len)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn private_matches_shared(&self) -> Result<bool, StorageError> {
        let file = self.file.lock();
        let shared = read_file_prefix(&file, self.len)?;
        Ok(shared == self.private)
    }

    fn backend(&self) -> ViewBackend {
        ViewBackend::Buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn data_file(dir: &TempDir, len: u64) -> File {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("data.0"))
            .unwrap();
        file.set_len(len).unwrap();
        file
    }

    fn exercise_views(backend: ViewBackend) {
        let dir = TempDir::new().unwrap();
        let mut view = backend.open(data_file(&dir, 4096), 4096).unwrap();
        assert_eq!(view.len(), 4096);
        assert_eq!(view.backend(), backend);

        view.write_private(100, b"hello").unwrap();

        let mut buf = [0u8; 5];
        view.read_private(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // The shared view is untouched until the applier writes it.
        view.read_shared(100, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 5]);
        assert!(!view.private_matches_shared().unwrap());

        view.write_shared(100, b"hello").unwrap();
        view.flush().unwrap();
        assert!(view.private_matches_shared().unwrap());

        let on_disk = std::fs::read(dir.path().join("data.0")).unwrap();
        assert_eq!(&on_disk[100..105], b"hello");
    }

    fn exercise_remap(backend: ViewBackend) {
        let dir = TempDir::new().unwrap();
        let mut view = backend.open(data_file(&dir, 4096), 4096).unwrap();

        view.write_private(0, b"uncommitted").unwrap();
        view.write_shared(2048, b"committed").unwrap();
        view.remap_private().unwrap();

        let mut buf = [0u8; 11];
        view.read_private(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 11]);

        let mut buf = [0u8; 9];
        view.read_private(2048, &mut buf).unwrap();
        assert_eq!(&buf, b"committed");
        assert!(view.private_matches_shared().unwrap());
    }

    #[test]
    fn test_mmap_views() {
        exercise_views(ViewBackend::Mmap);
    }

    #[test]
    fn test_buffered_views() {
        exercise_views(ViewBackend::Buffered);
    }

    #[test]
    fn test_mmap_remap() {
        exercise_remap(ViewBackend::Mmap);
    }

    #[test]
    fn test_buffered_remap() {
        exercise_remap(ViewBackend::Buffered);
    }

    #[test]
    fn test_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let mut view = ViewBackend::Buffered
            .open(data_file(&dir, 128), 128)
            .unwrap();
        let result = view.write_private(120, &[0u8; 16]);
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));

        let mut buf = [0u8; 4];
        assert!(view.read_shared(u64::MAX - 1, &mut buf).is_err());
    }

    #[test]
    fn test_empty_file_cannot_be_mapped() {
        let dir = TempDir::new().unwrap();
        let result = MmapFile::open(data_file(&dir, 0), 0);
        assert!(matches!(result, Err(StorageError::InvalidFile(_))));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("mmap".parse::<ViewBackend>().unwrap(), ViewBackend::Mmap);
        assert_eq!(
            "Buffered".parse::<ViewBackend>().unwrap(),
            ViewBackend::Buffered
        );
        assert!("direct".parse::<ViewBackend>().is_err());
    }
}
