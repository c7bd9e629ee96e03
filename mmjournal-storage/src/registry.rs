//! Registry of open data files.
//!
//! Files are laid out back to back in one private view address space,
//! starting at [`BASE_ADDRESS`]. Closing a file leaves a hole; addresses
//! are never reused.

use crate::error::StorageError;
use crate::file::{DurableFile, FileId, ViewAddress};
use crate::view::ViewBackend;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// First address handed out to a data file.
pub const BASE_ADDRESS: u64 = 1 << 20;

/// A piece of an address range that lies within one file.
#[derive(Debug, Clone)]
pub struct MappedRange {
    pub file: Arc<DurableFile>,
    /// Offset within the file.
    pub offset: u64,
    pub len: u64,
}

struct RegistryInner {
    by_base: BTreeMap<u64, Arc<DurableFile>>,
    by_id: HashMap<FileId, Arc<DurableFile>>,
    by_name: HashMap<String, FileId>,
    next_base: u64,
}

/// All data files currently open under one data directory.
pub struct FileRegistry {
    data_dir: PathBuf,
    backend: ViewBackend,
    inner: RwLock<RegistryInner>,
    next_id: AtomicU32,
    /// Bytes written to private views since the last remap pass.
    private_map_bytes: AtomicU64,
}

impl FileRegistry {
    /// Creates an empty registry over `data_dir`, creating the directory.
    pub fn new(data_dir: impl Into<PathBuf>, backend: ViewBackend) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            backend,
            inner: RwLock::new(RegistryInner {
                by_base: BTreeMap::new(),
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                next_base: BASE_ADDRESS,
            }),
            next_id: AtomicU32::new(1),
            private_map_bytes: AtomicU64::new(0),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backend(&self) -> ViewBackend {
        self.backend
    }

    /// Creates a new zero-filled data file of `len` bytes and opens it.
    pub fn create(&self, name: &str, len: u64) -> Result<Arc<DurableFile>, StorageError> {
        let path = data_file_path(&self.data_dir, name)?;
        if len == 0 {
            return Err(StorageError::InvalidFile(format!(
                "data file {} must not be empty",
                name
            )));
        }
        if path.exists() {
            return Err(StorageError::FileExists(name.to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(len)?;
        file.sync_all()?;

        tracing::debug!("Created data file {} ({} bytes)", name, len);
        self.register(name, path, file, len)
    }

    /// Opens an existing data file, or returns it if already open.
    pub fn open(&self, name: &str) -> Result<Arc<DurableFile>, StorageError> {
        if let Some(file) = self.find(name) {
            return Ok(file);
        }

        let path = data_file_path(&self.data_dir, name)?;
        if !path.exists() {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        self.register(name, path, file, len)
    }

    fn register(
        &self,
        name: &str,
        path: PathBuf,
        file: std::fs::File,
        len: u64,
    ) -> Result<Arc<DurableFile>, StorageError> {
        let view = self.backend.open(file, len)?;

        let mut inner = self.inner.write();
        if let Some(id) = inner.by_name.get(name) {
            if let Some(existing) = inner.by_id.get(id) {
                return Ok(Arc::clone(existing));
            }
        }

        let id = FileId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let base = ViewAddress(inner.next_base);
        inner.next_base += len;

        let durable = Arc::new(DurableFile::new(id, name.to_string(), path, base, view));
        inner.by_base.insert(base.0, Arc::clone(&durable));
        inner.by_id.insert(id, Arc::clone(&durable));
        inner.by_name.insert(name.to_string(), id);

        tracing::debug!("Opened data file {} as {} at {}", name, id, base);
        Ok(durable)
    }

    /// Flushes a file's shared view and removes it from the registry.
    pub fn close(&self, id: FileId) -> Result<Arc<DurableFile>, StorageError> {
        let file = {
            let mut inner = self.inner.write();
            let file = inner
                .by_id
                .remove(&id)
                .ok_or(StorageError::UnknownFileId(id.0))?;
            inner.by_base.remove(&file.base().0);
            inner.by_name.remove(file.name());
            file
        };
        file.flush()?;
        tracing::debug!("Closed data file {}", file.name());
        Ok(file)
    }

    pub fn get(&self, id: FileId) -> Option<Arc<DurableFile>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Looks up an open file by name.
    pub fn find(&self, name: &str) -> Option<Arc<DurableFile>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Returns the open files in address order.
    pub fn files(&self) -> Vec<Arc<DurableFile>> {
        self.inner.read().by_base.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits `[addr, addr + len)` into per-file pieces.
    pub fn resolve(&self, addr: ViewAddress, len: u64) -> Result<Vec<MappedRange>, StorageError> {
        let not_mapped = || StorageError::AddressNotMapped { addr: addr.0, len };
        let end = addr.0.checked_add(len).ok_or_else(not_mapped)?;

        let inner = self.inner.read();
        let mut pieces = Vec::with_capacity(1);
        let mut cursor = addr.0;

        while cursor < end {
            let (_, file) = inner
                .by_base
                .range(..=cursor)
                .next_back()
                .ok_or_else(not_mapped)?;
            if !file.contains(ViewAddress(cursor)) {
                return Err(not_mapped());
            }
            let file_end = file.base().0 + file.len();
            let piece_end = end.min(file_end);
            pieces.push(MappedRange {
                file: Arc::clone(file),
                offset: cursor - file.base().0,
                len: piece_end - cursor,
            });
            cursor = piece_end;
        }

        Ok(pieces)
    }

    /// Reads from the private views.
    pub fn read(&self, addr: ViewAddress, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut done = 0usize;
        for piece in self.resolve(addr, buf.len() as u64)? {
            let len = piece.len as usize;
            piece
                .file
                .read_private(piece.offset, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Writes to the private views.
    pub fn write_private(&self, addr: ViewAddress, data: &[u8]) -> Result<(), StorageError> {
        let mut done = 0usize;
        for piece in self.resolve(addr, data.len() as u64)? {
            let len = piece.len as usize;
            piece
                .file
                .write_private(piece.offset, &data[done..done + len])?;
            done += len;
        }
        self.private_map_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes every shared view to disk. Returns the number of files.
    pub fn flush_all(&self) -> Result<usize, StorageError> {
        let files = self.files();
        for file in &files {
            file.flush()?;
        }
        Ok(files.len())
    }

    /// Records bytes that dirtied private views outside `write_private`.
    pub fn note_private_bytes(&self, bytes: u64) {
        self.private_map_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn private_map_bytes(&self) -> u64 {
        self.private_map_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_private_map_bytes(&self) {
        self.private_map_bytes.store(0, Ordering::Relaxed);
    }
}

/// Resolves a data file name under `dir`, rejecting names that escape it.
pub fn data_file_path(dir: &Path, name: &str) -> Result<PathBuf, StorageError> {
    let relative = Path::new(name);
    let valid = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(StorageError::InvalidFile(format!(
            "invalid data file name: {:?}",
            name
        )));
    }
    Ok(dir.join(relative))
}
