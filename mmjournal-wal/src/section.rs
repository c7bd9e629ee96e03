//! Journal section format.
//!
//! A section is the unit written per group commit. On disk it is a fixed
//! header followed by the (optionally zstd-compressed) body:
//!
//! ```text
//! +----------+-------+---------+----------+----------+------------+----------+
//! | magic    | flags | version | reserved | length   | raw_length | crc32c   |
//! | 4 bytes  | 1     | 1       | 2        | 4 bytes  | 4 bytes    | 4 bytes  |
//! +----------+-------+---------+----------+----------+------------+----------+
//! | sequence            | timestamp_ms        | body                         |
//! | 8 bytes             | 8 bytes             | length bytes                 |
//! +---------------------+---------------------+------------------------------+
//! ```
//!
//! The checksum covers the header (with the checksum field zeroed) and the
//! body exactly as stored. `length` is the stored body length, patched after
//! compression; `raw_length` is the uncompressed body length.
//!
//! The uncompressed body is:
//!
//! ```text
//! file table:  u16 count, then { u32 file_id, u16 name_len, name }
//! durable ops: u32 count, then { u8 kind, kind-specific payload }
//! ranges:      u32 count, then { u16 file_index, u64 offset, u32 len, bytes }
//! ```
//!
//! Durable operations are replayed before any range so that files exist at
//! their recorded size when their bytes are applied.

use crate::error::WalError;
use crate::SECTION_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for journal sections: "JSEC"
pub const SECTION_MAGIC: [u8; 4] = *b"JSEC";

/// Current section format version.
pub const SECTION_VERSION: u8 = 1;

/// Maximum stored body size (512 MiB).
pub const MAX_SECTION_SIZE: usize = 512 * 1024 * 1024;

/// Header flag: body is zstd-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

const OP_FILE_CREATED: u8 = 1;
const CHECKSUM_OFFSET: usize = 16;

/// Returns the current wall-clock time in milliseconds, as stored in headers.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A parsed section header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub sequence: u64,
    pub timestamp_ms: i64,
    /// Stored body length in bytes.
    pub length: u32,
    /// Uncompressed body length in bytes.
    pub raw_length: u32,
    pub checksum: u32,
    pub compressed: bool,
}

impl SectionHeader {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&SECTION_MAGIC);
        buf.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        buf.put_u8(SECTION_VERSION);
        buf.put_u16(0);
        buf.put_u32(self.length);
        buf.put_u32(self.raw_length);
        buf.put_u32(self.checksum);
        buf.put_u64(self.sequence);
        buf.put_i64(self.timestamp_ms);
    }
}

/// Checksum over a header (checksum field zeroed) and its stored body.
fn section_checksum(header: &[u8], body: &[u8]) -> u32 {
    let mut zeroed = [0u8; SECTION_HEADER_SIZE];
    zeroed.copy_from_slice(&header[..SECTION_HEADER_SIZE]);
    zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
    let crc = crc32c::crc32c(&zeroed);
    crc32c::crc32c_append(crc, body)
}

/// A data file referenced by the ranges of a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFile {
    /// Runtime registry id of the file.
    pub file_id: u32,
    /// File name relative to the data directory.
    pub name: String,
}

/// An operation that must be replayed even when no byte range was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOp {
    /// A data file was created with the given length.
    FileCreated { name: String, len: u64 },
}

impl DurableOp {
    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), WalError> {
        match self {
            DurableOp::FileCreated { name, len } => {
                buf.put_u8(OP_FILE_CREATED);
                put_name(buf, name)?;
                buf.put_u64(*len);
            }
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WalError> {
        let kind = get_u8(buf)?;
        match kind {
            OP_FILE_CREATED => {
                let name = get_name(buf)?;
                let len = get_u64(buf)?;
                Ok(DurableOp::FileCreated { name, len })
            }
            other => Err(WalError::MalformedBody(format!(
                "unknown durable op kind: {}",
                other
            ))),
        }
    }
}

/// One captured byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRecord {
    /// Index into the section's file table.
    pub file_index: u16,
    /// Offset within the destination file.
    pub offset: u64,
    pub data: Bytes,
}

/// The decoded (uncompressed) body of a section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionBody {
    pub files: Vec<SectionFile>,
    pub ops: Vec<DurableOp>,
    pub ranges: Vec<RangeRecord>,
}

impl SectionBody {
    /// Decodes an uncompressed body.
    pub fn decode(mut buf: Bytes) -> Result<Self, WalError> {
        let file_count = get_u16(&mut buf)? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let file_id = get_u32(&mut buf)?;
            let name = get_name(&mut buf)?;
            files.push(SectionFile { file_id, name });
        }

        let op_count = get_u32(&mut buf)? as usize;
        let mut ops = Vec::with_capacity(op_count.min(1024));
        for _ in 0..op_count {
            ops.push(DurableOp::decode(&mut buf)?);
        }

        let range_count = get_u32(&mut buf)? as usize;
        let mut ranges = Vec::with_capacity(range_count.min(64 * 1024));
        for _ in 0..range_count {
            let file_index = get_u16(&mut buf)?;
            if file_index as usize >= files.len() {
                return Err(WalError::MalformedBody(format!(
                    "range references file index {} of {}",
                    file_index,
                    files.len()
                )));
            }
            let offset = get_u64(&mut buf)?;
            let len = get_u32(&mut buf)? as usize;
            if buf.remaining() < len {
                return Err(WalError::MalformedBody(format!(
                    "range of {} bytes exceeds remaining body ({} bytes)",
                    len,
                    buf.remaining()
                )));
            }
            let data = buf.split_to(len);
            ranges.push(RangeRecord {
                file_index,
                offset,
                data,
            });
        }

        if buf.has_remaining() {
            return Err(WalError::MalformedBody(format!(
                "{} trailing bytes after ranges",
                buf.remaining()
            )));
        }

        Ok(Self { files, ops, ranges })
    }

    /// Returns the file a range belongs to.
    pub fn file_of(&self, range: &RangeRecord) -> &SectionFile {
        &self.files[range.file_index as usize]
    }

    /// Total payload bytes across all ranges.
    pub fn range_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.data.len() as u64).sum()
    }
}

/// Incrementally serializes a section body.
///
/// The file table and durable operations are written up front; ranges are
/// appended afterwards, copying their payload straight into the buffer.
pub struct SectionWriter {
    buf: BytesMut,
    file_count: u16,
    range_count_pos: usize,
    range_count: u32,
    range_bytes: u64,
}

impl SectionWriter {
    /// Starts a body with the given file table and durable operations.
    pub fn new(files: &[SectionFile], ops: &[DurableOp]) -> Result<Self, WalError> {
        Self::with_capacity(files, ops, 4096)
    }

    /// Like [`SectionWriter::new`], reserving `capacity` bytes up front.
    pub fn with_capacity(
        files: &[SectionFile],
        ops: &[DurableOp],
        capacity: usize,
    ) -> Result<Self, WalError> {
        if files.len() > u16::MAX as usize {
            return Err(WalError::InvalidState(format!(
                "too many files in one section: {}",
                files.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_u16(files.len() as u16);
        for file in files {
            buf.put_u32(file.file_id);
            put_name(&mut buf, &file.name)?;
        }

        buf.put_u32(ops.len() as u32);
        for op in ops {
            op.encode_into(&mut buf)?;
        }

        let range_count_pos = buf.len();
        buf.put_u32(0);

        Ok(Self {
            buf,
            file_count: files.len() as u16,
            range_count_pos,
            range_count: 0,
            range_bytes: 0,
        })
    }

    /// Appends a range whose payload is already in memory.
    pub fn push_range(&mut self, file_index: u16, offset: u64, data: &[u8]) {
        self.put_range_header(file_index, offset, data.len() as u32);
        self.buf.put_slice(data);
    }

    /// Appends a range of `len` bytes, letting `fill` write the payload in place.
    pub fn push_range_with<E, F>(
        &mut self,
        file_index: u16,
        offset: u64,
        len: u32,
        fill: F,
    ) -> Result<(), E>
    where
        F: FnOnce(&mut [u8]) -> Result<(), E>,
    {
        self.put_range_header(file_index, offset, len);
        let start = self.buf.len();
        self.buf.resize(start + len as usize, 0);
        fill(&mut self.buf[start..])
    }

    fn put_range_header(&mut self, file_index: u16, offset: u64, len: u32) {
        assert!(
            file_index < self.file_count,
            "range file index {} outside file table of {}",
            file_index,
            self.file_count
        );
        self.buf.put_u16(file_index);
        self.buf.put_u64(offset);
        self.buf.put_u32(len);
        self.range_count += 1;
        self.range_bytes += len as u64;
    }

    /// Number of ranges appended so far.
    pub fn range_count(&self) -> u32 {
        self.range_count
    }

    /// Payload bytes appended so far.
    pub fn range_bytes(&self) -> u64 {
        self.range_bytes
    }

    /// Seals the body under the given sequence number.
    pub fn finish(mut self, sequence: u64, timestamp_ms: i64) -> PreparedSection {
        let pos = self.range_count_pos;
        self.buf[pos..pos + 4].copy_from_slice(&self.range_count.to_be_bytes());
        PreparedSection {
            sequence,
            timestamp_ms,
            body: self.buf.freeze(),
            range_count: self.range_count,
            range_bytes: self.range_bytes,
        }
    }
}

/// A fully built, uncompressed section waiting to be journaled.
#[derive(Debug, Clone)]
pub struct PreparedSection {
    pub sequence: u64,
    pub timestamp_ms: i64,
    /// Uncompressed body.
    pub body: Bytes,
    pub range_count: u32,
    pub range_bytes: u64,
}

impl PreparedSection {
    /// Encodes header and body for disk. With `compression_level` set the
    /// body is zstd-compressed unless that would not make it smaller.
    pub fn encode(&self, compression_level: Option<i32>) -> Result<Bytes, WalError> {
        if self.body.len() > MAX_SECTION_SIZE {
            return Err(WalError::SectionTooLarge {
                size: self.body.len(),
                max: MAX_SECTION_SIZE,
            });
        }

        let compressed = match compression_level {
            Some(level) => {
                let out = zstd::bulk::compress(&self.body, level)
                    .map_err(|e| WalError::Compression(e.to_string()))?;
                if out.len() < self.body.len() {
                    Some(out)
                } else {
                    None
                }
            }
            None => None,
        };
        let stored: &[u8] = compressed.as_deref().unwrap_or(&self.body);

        let mut header = SectionHeader {
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            length: stored.len() as u32,
            raw_length: self.body.len() as u32,
            checksum: 0,
            compressed: compressed.is_some(),
        };

        let mut buf = BytesMut::with_capacity(SECTION_HEADER_SIZE + stored.len());
        header.encode_into(&mut buf);
        header.checksum = section_checksum(&buf, stored);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&header.checksum.to_be_bytes());
        buf.put_slice(stored);

        Ok(buf.freeze())
    }

    /// Decodes the body back into ranges and operations.
    pub fn decode_body(&self) -> Result<SectionBody, WalError> {
        SectionBody::decode(self.body.clone())
    }
}

/// A section read back from the journal.
#[derive(Debug, Clone)]
pub struct JournalSection {
    pub header: SectionHeader,
    pub body: SectionBody,
}

impl JournalSection {
    /// Decodes a section from the front of `buf`.
    ///
    /// Returns `Ok(None)` if the buffer holds an incomplete section or the
    /// zero fill of a preallocated file. On success the section is consumed
    /// from `buf`.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, WalError> {
        if buf.len() < SECTION_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != SECTION_MAGIC {
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let flags = buf[4];
        let version = buf[5];
        if version != SECTION_VERSION {
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("unsupported section version: {}", version),
            });
        }

        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let raw_length = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let checksum = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let sequence = u64::from_be_bytes([
            buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
        ]);
        let timestamp_ms = i64::from_be_bytes([
            buf[28], buf[29], buf[30], buf[31], buf[32], buf[33], buf[34], buf[35],
        ]);

        if length as usize > MAX_SECTION_SIZE || raw_length as usize > MAX_SECTION_SIZE {
            return Err(WalError::SectionTooLarge {
                size: length.max(raw_length) as usize,
                max: MAX_SECTION_SIZE,
            });
        }

        let total_len = SECTION_HEADER_SIZE + length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let actual = section_checksum(&buf[..SECTION_HEADER_SIZE], &buf[SECTION_HEADER_SIZE..total_len]);
        if actual != checksum {
            return Err(WalError::CorruptedSection {
                offset,
                expected: checksum,
                actual,
            });
        }

        buf.advance(SECTION_HEADER_SIZE);
        let stored = buf.split_to(length as usize).freeze();

        let compressed = flags & FLAG_COMPRESSED != 0;
        let raw = if compressed {
            let out = zstd::bulk::decompress(&stored, raw_length as usize)
                .map_err(|e| WalError::Compression(e.to_string()))?;
            Bytes::from(out)
        } else {
            stored
        };
        if raw.len() != raw_length as usize {
            return Err(WalError::MalformedBody(format!(
                "body is {} bytes, header says {}",
                raw.len(),
                raw_length
            )));
        }

        let body = SectionBody::decode(raw)?;

        Ok(Some(Self {
            header: SectionHeader {
                sequence,
                timestamp_ms,
                length,
                raw_length,
                checksum,
                compressed,
            },
            body,
        }))
    }

    /// Returns the total size of this section on disk.
    pub fn disk_size(&self) -> usize {
        SECTION_HEADER_SIZE + self.header.length as usize
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), WalError> {
    if name.len() > u16::MAX as usize {
        return Err(WalError::InvalidState(format!(
            "file name too long: {} bytes",
            name.len()
        )));
    }
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn get_name(buf: &mut Bytes) -> Result<String, WalError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated("file name"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| WalError::MalformedBody(format!("file name is not UTF-8: {}", e)))
}

fn truncated(what: &str) -> WalError {
    WalError::MalformedBody(format!("body truncated while reading {}", what))
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WalError> {
    if buf.remaining() < 1 {
        return Err(truncated("u8"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WalError> {
    if buf.remaining() < 2 {
        return Err(truncated("u16"));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WalError> {
    if buf.remaining() < 4 {
        return Err(truncated("u32"));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WalError> {
    if buf.remaining() < 8 {
        return Err(truncated("u64"));
    }
    Ok(buf.get_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_files() -> Vec<SectionFile> {
        vec![
            SectionFile {
                file_id: 7,
                name: "test.0".to_string(),
            },
            SectionFile {
                file_id: 9,
                name: "test.1".to_string(),
            },
        ]
    }

    fn sample_section(sequence: u64) -> PreparedSection {
        let ops = vec![DurableOp::FileCreated {
            name: "test.1".to_string(),
            len: 8192,
        }];
        let mut writer = SectionWriter::new(&sample_files(), &ops).unwrap();
        writer.push_range(0, 100, &[0xAB; 50]);
        writer.push_range(1, 200, &[0xCD; 60]);
        writer.finish(sequence, 1_700_000_000_000)
    }

    #[test]
    fn test_section_roundtrip() {
        let prepared = sample_section(3);
        assert_eq!(prepared.range_count, 2);
        assert_eq!(prepared.range_bytes, 110);

        let encoded = prepared.encode(None).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let section = JournalSection::decode(&mut buf, 0).unwrap().unwrap();

        assert!(buf.is_empty());
        assert_eq!(section.header.sequence, 3);
        assert_eq!(section.header.timestamp_ms, 1_700_000_000_000);
        assert!(!section.header.compressed);
        assert_eq!(section.disk_size(), encoded.len());
        assert_eq!(section.body.files, sample_files());
        assert_eq!(section.body.ranges.len(), 2);
        assert_eq!(section.body.range_bytes(), 110);
        assert_eq!(section.body.file_of(&section.body.ranges[1]).name, "test.1");
        assert_eq!(&section.body.ranges[0].data[..], &[0xAB; 50][..]);
        assert_eq!(
            section.body.ops,
            vec![DurableOp::FileCreated {
                name: "test.1".to_string(),
                len: 8192
            }]
        );
    }

    #[test]
    fn test_compressed_section_patches_length() {
        let mut writer = SectionWriter::new(&sample_files(), &[]).unwrap();
        writer.push_range(0, 0, &vec![0u8; 64 * 1024]);
        let prepared = writer.finish(1, 0);

        let encoded = prepared.encode(Some(3)).unwrap();
        assert!(encoded.len() < prepared.body.len());

        let mut buf = BytesMut::from(&encoded[..]);
        let section = JournalSection::decode(&mut buf, 0).unwrap().unwrap();
        assert!(section.header.compressed);
        assert_eq!(section.header.raw_length as usize, prepared.body.len());
        assert_eq!(
            section.header.length as usize,
            encoded.len() - SECTION_HEADER_SIZE
        );
        assert_eq!(section.body.ranges[0].data.len(), 64 * 1024);
    }

    #[test]
    fn test_incompressible_body_stored_raw() {
        let mut writer = SectionWriter::new(&sample_files(), &[]).unwrap();
        writer.push_range(0, 0, &[1, 2, 3]);
        let prepared = writer.finish(1, 0);

        let encoded = prepared.encode(Some(3)).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let section = JournalSection::decode(&mut buf, 0).unwrap().unwrap();
        assert!(!section.header.compressed);
    }

    #[test]
    fn test_empty_section_with_ops_only() {
        let ops = vec![DurableOp::FileCreated {
            name: "db.0".to_string(),
            len: 4096,
        }];
        let prepared = SectionWriter::new(&[], &ops).unwrap().finish(1, 0);
        let encoded = prepared.encode(None).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let section = JournalSection::decode(&mut buf, 0).unwrap().unwrap();
        assert!(section.body.ranges.is_empty());
        assert_eq!(section.body.ops.len(), 1);
    }

    #[test]
    fn test_corrupted_section_detection() {
        let encoded = sample_section(1).encode(None).unwrap();
        let mut corrupted = BytesMut::from(&encoded[..]);
        let len = corrupted.len();
        corrupted[len - 1] ^= 0xFF;

        let result = JournalSection::decode(&mut corrupted, 0);
        assert!(matches!(result, Err(WalError::CorruptedSection { .. })));
    }

    #[test]
    fn test_corrupted_header_detection() {
        let encoded = sample_section(1).encode(None).unwrap();
        let mut corrupted = BytesMut::from(&encoded[..]);
        // Flip a bit of the sequence number; the checksum covers the header.
        corrupted[27] ^= 0x01;

        let result = JournalSection::decode(&mut corrupted, 0);
        assert!(matches!(result, Err(WalError::CorruptedSection { .. })));
    }

    #[test]
    fn test_incomplete_section() {
        let encoded = sample_section(1).encode(None).unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 10]);
        assert!(JournalSection::decode(&mut buf, 0).unwrap().is_none());

        let mut short = BytesMut::from(&b"JSEC"[..]);
        assert!(JournalSection::decode(&mut short, 0).unwrap().is_none());
    }

    #[test]
    fn test_zero_fill_is_end_of_journal() {
        let mut buf = BytesMut::from(&[0u8; 64][..]);
        assert!(JournalSection::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&[0x42u8; 64][..]);
        let result = JournalSection::decode(&mut buf, 0);
        assert!(matches!(result, Err(WalError::InvalidHeader { .. })));
        assert!(result.unwrap_err().is_crash_artifact());
    }

    #[test]
    fn test_push_range_with_fills_in_place() {
        let mut writer = SectionWriter::new(&sample_files(), &[]).unwrap();
        writer
            .push_range_with(1, 10, 4, |buf| {
                buf.copy_from_slice(b"abcd");
                Ok::<(), WalError>(())
            })
            .unwrap();
        let body = writer.finish(1, 0).decode_body().unwrap();
        assert_eq!(&body.ranges[0].data[..], b"abcd");
        assert_eq!(body.ranges[0].offset, 10);
    }

    #[test]
    #[should_panic(expected = "outside file table")]
    fn test_range_with_unknown_file_panics() {
        let mut writer = SectionWriter::new(&sample_files(), &[]).unwrap();
        writer.push_range(5, 0, b"x");
    }

    #[test]
    fn test_bad_file_index_rejected_on_decode() {
        // Hand-built body: one file, no ops, one range pointing at index 3.
        let mut body = BytesMut::new();
        body.put_u16(1);
        body.put_u32(1);
        put_name(&mut body, "a").unwrap();
        body.put_u32(0);
        body.put_u32(1);
        body.put_u16(3);
        body.put_u64(0);
        body.put_u32(0);

        let result = SectionBody::decode(body.freeze());
        assert!(matches!(result, Err(WalError::MalformedBody(_))));
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.]{0,15}"
    }

    type Parts = (Vec<SectionFile>, Vec<DurableOp>, Vec<(usize, u64, Vec<u8>)>);

    fn section_strategy() -> impl Strategy<Value = Parts> {
        (
            prop::collection::vec((any::<u32>(), name_strategy()), 1..5),
            prop::collection::vec((name_strategy(), any::<u64>()), 0..4),
            prop::collection::vec(
                (any::<usize>(), any::<u64>(), prop::collection::vec(any::<u8>(), 0..128)),
                0..16,
            ),
        )
            .prop_map(|(files, ops, ranges)| {
                let files = files
                    .into_iter()
                    .map(|(file_id, name)| SectionFile { file_id, name })
                    .collect();
                let ops = ops
                    .into_iter()
                    .map(|(name, len)| DurableOp::FileCreated { name, len })
                    .collect();
                (files, ops, ranges)
            })
    }

    fn build(
        files: &[SectionFile],
        ops: &[DurableOp],
        ranges: &[(usize, u64, Vec<u8>)],
        sequence: u64,
    ) -> PreparedSection {
        let mut writer = SectionWriter::new(files, ops).unwrap();
        for (seed, offset, data) in ranges {
            writer.push_range((seed % files.len()) as u16, *offset, data);
        }
        writer.finish(sequence, 1_700_000_000_000)
    }

    proptest! {
        #[test]
        fn prop_section_roundtrip(
            (files, ops, ranges) in section_strategy(),
            sequence in any::<u64>(),
            compression in prop::option::of(1i32..4),
        ) {
            let prepared = build(&files, &ops, &ranges, sequence);
            let encoded = prepared.encode(compression).unwrap();

            let mut buf = BytesMut::from(&encoded[..]);
            let section = JournalSection::decode(&mut buf, 0).unwrap().unwrap();
            prop_assert!(buf.is_empty());
            prop_assert_eq!(section.disk_size(), encoded.len());
            prop_assert_eq!(section.header.sequence, sequence);
            prop_assert_eq!(&section.body.files, &files);
            prop_assert_eq!(&section.body.ops, &ops);
            prop_assert_eq!(section.body.ranges.len(), ranges.len());
            for (record, (seed, offset, data)) in section.body.ranges.iter().zip(&ranges) {
                prop_assert_eq!(record.file_index as usize, seed % files.len());
                prop_assert_eq!(record.offset, *offset);
                prop_assert_eq!(&record.data[..], &data[..]);
            }
        }

        #[test]
        fn prop_cut_section_reads_as_incomplete(
            (files, ops, ranges) in section_strategy(),
            cut in any::<prop::sample::Index>(),
        ) {
            let encoded = build(&files, &ops, &ranges, 1).encode(None).unwrap();
            let cut = cut.index(encoded.len());

            let mut buf = BytesMut::from(&encoded[..cut]);
            prop_assert!(JournalSection::decode(&mut buf, 0).unwrap().is_none());
            prop_assert_eq!(buf.len(), cut);
        }

        #[test]
        fn prop_zero_padded_cut_never_decodes_wrong(
            (files, ops, ranges) in section_strategy(),
            cut in any::<prop::sample::Index>(),
        ) {
            // A torn write into a preallocated file: the unwritten rest is zero.
            let encoded = build(&files, &ops, &ranges, 1).encode(None).unwrap();
            let cut = cut.index(encoded.len());
            let mut padded = encoded[..cut].to_vec();
            padded.resize(encoded.len() + 64, 0);

            let mut buf = BytesMut::from(&padded[..]);
            match JournalSection::decode(&mut buf, 0) {
                Ok(None) => {}
                // Only possible when the cut-off bytes were zero already.
                Ok(Some(section)) => {
                    prop_assert_eq!(section.disk_size(), encoded.len());
                    prop_assert_eq!(&section.body.files, &files);
                }
                Err(e) => prop_assert!(e.is_crash_artifact(), "unexpected error: {}", e),
            }
        }
    }
}
