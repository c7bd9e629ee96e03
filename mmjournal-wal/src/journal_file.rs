//! Journal file management.
//!
//! The journal is split into numbered files:
//! - Rotation: a new file once the current one reaches the size limit
//! - Preallocation: files may be extended with zeros up front
//! - Age-out: files older than the active one can be deleted once the data
//!   files have been flushed

use crate::error::WalError;
use crate::section::JournalSection;
use crate::SECTION_HEADER_SIZE;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Journal file identifier (monotonically increasing).
pub type JournalFileId = u64;

/// Journal file name format: NNNNNNNNNNNNNNNN.jnl (16 hex digits)
pub fn journal_filename(id: JournalFileId) -> String {
    format!("{:016x}.jnl", id)
}

/// Parse journal file ID from filename.
pub fn parse_journal_filename(name: &str) -> Option<JournalFileId> {
    let name = name.strip_suffix(".jnl")?;
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// A single journal file open for appending.
pub struct JournalFile {
    id: JournalFileId,
    path: PathBuf,
    file: File,
    /// Next write offset; bytes past it are zero fill.
    position: u64,
    max_size: u64,
    sync_pending: bool,
}

impl JournalFile {
    /// Creates a new journal file, extending it to `max_size` with zeros
    /// when `preallocate` is set.
    pub fn create(
        dir: &Path,
        id: JournalFileId,
        max_size: u64,
        preallocate: bool,
    ) -> Result<Self, WalError> {
        let path = dir.join(journal_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if preallocate {
            file.set_len(max_size)?;
            file.sync_all()?;
        }

        Ok(Self {
            id,
            path,
            file,
            position: 0,
            max_size,
            sync_pending: false,
        })
    }

    /// Returns the file ID.
    pub fn id(&self) -> JournalFileId {
        self.id
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes of sections written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns whether a section of the given encoded size still fits.
    /// An empty file accepts any section so oversized sections still land.
    pub fn can_fit(&self, section_size: usize) -> bool {
        self.position == 0 || self.position + section_size as u64 <= self.max_size
    }

    /// Appends an encoded section; returns the offset it was written at.
    pub fn append(&mut self, encoded: &[u8]) -> Result<u64, WalError> {
        let offset = self.position;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(encoded)?;
        self.position += encoded.len() as u64;
        self.sync_pending = true;
        Ok(offset)
    }

    /// Forces written sections to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }
}

/// The decodable prefix of a journal file.
#[derive(Debug)]
pub struct FileContents {
    /// Valid sections with their offsets.
    pub sections: Vec<(u64, JournalSection)>,
    /// Offset just past the last valid section.
    pub end: u64,
    /// File length on disk.
    pub len: u64,
    /// The error that stopped decoding, if any.
    pub error: Option<WalError>,
    /// Whether everything past `end` is zero fill.
    pub clean_tail: bool,
    /// Whether the section that failed to decode is followed only by zero
    /// fill, the shape a crash leaves in a preallocated file.
    pub torn_tail: bool,
}

/// Reads every decodable section of a journal file from the start.
///
/// Decoding stops at zero fill, at a torn trailing section, or at the first
/// corrupt section; only I/O errors are returned as `Err`.
pub fn read_sections(path: &Path) -> Result<FileContents, WalError> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let len = data.len() as u64;

    let mut buf = BytesMut::from(&data[..]);
    let mut sections = Vec::new();
    let mut offset = 0u64;

    let error = loop {
        match JournalSection::decode(&mut buf, offset) {
            Ok(Some(section)) => {
                let size = section.disk_size() as u64;
                sections.push((offset, section));
                offset += size;
            }
            Ok(None) => break None,
            Err(e) if e.is_crash_artifact() => break Some(e),
            Err(e) => return Err(e),
        }
    };

    let clean_tail = error.is_none() && data[offset as usize..].iter().all(|&b| b == 0);
    let torn_tail = matches!(error, Some(WalError::CorruptedSection { .. }))
        && zero_filled_after(&data, offset as usize);

    Ok(FileContents {
        sections,
        end: offset,
        len,
        error,
        clean_tail,
        torn_tail,
    })
}

/// Returns whether the section at `start` is followed by at least one byte
/// of zero fill and nothing else.
fn zero_filled_after(data: &[u8], start: usize) -> bool {
    let Some(header) = data.get(start..start + SECTION_HEADER_SIZE) else {
        return false;
    };
    let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let extent = start + SECTION_HEADER_SIZE + length;
    extent < data.len() && data[extent..].iter().all(|&b| b == 0)
}

/// Journal directory scanner.
pub struct JournalFileScanner;

impl JournalFileScanner {
    /// Lists all journal file IDs in a directory, sorted ascending.
    pub fn list_files(dir: &Path) -> Result<Vec<JournalFileId>, WalError> {
        let mut files = Vec::new();

        if !dir.exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = parse_journal_filename(&name) {
                files.push(id);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Returns the latest journal file ID, or None if there are none.
    pub fn latest_file(dir: &Path) -> Result<Option<JournalFileId>, WalError> {
        let files = Self::list_files(dir)?;
        Ok(files.last().copied())
    }

    /// Returns the path of a journal file.
    pub fn path_of(dir: &Path, id: JournalFileId) -> PathBuf {
        dir.join(journal_filename(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{SectionFile, SectionWriter};
    use tempfile::TempDir;

    fn encoded_section(sequence: u64) -> bytes::Bytes {
        let files = vec![SectionFile {
            file_id: 1,
            name: "data.0".to_string(),
        }];
        let mut writer = SectionWriter::new(&files, &[]).unwrap();
        writer.push_range(0, sequence * 10, &[sequence as u8; 16]);
        writer.finish(sequence, 0).encode(None).unwrap()
    }

    #[test]
    fn test_journal_filename() {
        assert_eq!(journal_filename(0), "0000000000000000.jnl");
        assert_eq!(journal_filename(255), "00000000000000ff.jnl");
    }

    #[test]
    fn test_parse_journal_filename() {
        assert_eq!(parse_journal_filename("0000000000000000.jnl"), Some(0));
        assert_eq!(parse_journal_filename("00000000000000ff.jnl"), Some(255));
        assert_eq!(parse_journal_filename("invalid.jnl"), None);
        assert_eq!(parse_journal_filename("0000000000000000.wal"), None);
    }

    #[test]
    fn test_append_and_read_sections() {
        let dir = TempDir::new().unwrap();
        let mut file = JournalFile::create(dir.path(), 1, 1 << 20, false).unwrap();

        for seq in 1..=3 {
            file.append(&encoded_section(seq)).unwrap();
        }
        file.sync().unwrap();

        let contents = read_sections(file.path()).unwrap();
        assert_eq!(contents.sections.len(), 3);
        assert_eq!(contents.end, file.position());
        assert!(contents.error.is_none());
        assert!(contents.clean_tail);
        assert_eq!(contents.sections[2].1.header.sequence, 3);
    }

    #[test]
    fn test_preallocated_tail_reads_as_end() {
        let dir = TempDir::new().unwrap();
        let mut file = JournalFile::create(dir.path(), 1, 64 * 1024, true).unwrap();
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 64 * 1024);

        file.append(&encoded_section(1)).unwrap();
        file.sync().unwrap();

        let contents = read_sections(file.path()).unwrap();
        assert_eq!(contents.sections.len(), 1);
        assert_eq!(contents.end, file.position());
        assert_eq!(contents.len, 64 * 1024);
        assert!(contents.clean_tail);
    }

    #[test]
    fn test_torn_tail_is_not_clean() {
        let dir = TempDir::new().unwrap();
        let mut file = JournalFile::create(dir.path(), 1, 1 << 20, false).unwrap();
        file.append(&encoded_section(1)).unwrap();
        let torn = encoded_section(2);
        file.append(&torn[..torn.len() / 2]).unwrap();

        let contents = read_sections(file.path()).unwrap();
        assert_eq!(contents.sections.len(), 1);
        assert!(contents.error.is_none());
        assert!(!contents.clean_tail);
        assert!(!contents.torn_tail);
    }

    #[test]
    fn test_half_zeroed_section_in_preallocated_file_is_torn() {
        let dir = TempDir::new().unwrap();
        let mut file = JournalFile::create(dir.path(), 1, 64 * 1024, true).unwrap();
        file.append(&encoded_section(1)).unwrap();
        let second = encoded_section(2);
        let start = file.position() as usize;
        file.append(&second).unwrap();
        file.sync().unwrap();

        let mut data = std::fs::read(file.path()).unwrap();
        let cut = start + second.len() - 8;
        data[cut..start + second.len()].fill(0);
        std::fs::write(file.path(), &data).unwrap();

        let contents = read_sections(file.path()).unwrap();
        assert_eq!(contents.sections.len(), 1);
        assert_eq!(contents.end, start as u64);
        assert!(matches!(
            contents.error,
            Some(WalError::CorruptedSection { .. })
        ));
        assert!(contents.torn_tail);
    }

    #[test]
    fn test_damaged_section_followed_by_data_is_not_torn() {
        let dir = TempDir::new().unwrap();
        let mut file = JournalFile::create(dir.path(), 1, 64 * 1024, true).unwrap();
        let first = encoded_section(1);
        file.append(&first).unwrap();
        file.append(&encoded_section(2)).unwrap();
        file.sync().unwrap();

        let mut data = std::fs::read(file.path()).unwrap();
        data[first.len() - 1] ^= 0xFF;
        std::fs::write(file.path(), &data).unwrap();

        let contents = read_sections(file.path()).unwrap();
        assert!(contents.sections.is_empty());
        assert!(contents.error.is_some());
        assert!(!contents.torn_tail);
    }

    #[test]
    fn test_can_fit() {
        let dir = TempDir::new().unwrap();
        let mut file = JournalFile::create(dir.path(), 1, 100, false).unwrap();
        assert!(file.can_fit(1000));
        file.append(&[1u8; 60]).unwrap();
        assert!(file.can_fit(40));
        assert!(!file.can_fit(41));
    }

    #[test]
    fn test_list_files() {
        let dir = TempDir::new().unwrap();
        for id in [3, 1, 2] {
            JournalFile::create(dir.path(), id, 1024, false).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(JournalFileScanner::list_files(dir.path()).unwrap(), vec![1, 2, 3]);
        assert_eq!(JournalFileScanner::latest_file(dir.path()).unwrap(), Some(3));
        assert!(JournalFileScanner::list_files(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
    }
}
