//! Building the log buffer for a commit.
//!
//! Runs while writers are excluded: the captured bytes are read straight
//! from the private views.

use crate::commit_job::JobSnapshot;
use crate::error::DurError;
use mmjournal_storage::{FileId, FileRegistry, MappedRange};
use mmjournal_wal::{section::now_millis, PreparedSection, SectionFile, SectionWriter};
use std::collections::HashMap;

/// Per-range overhead in the body: file index, offset, length.
const RANGE_HEADER_BYTES: usize = 2 + 8 + 4;

/// Serializes the snapshot into a section numbered `sequence`.
///
/// Intents spanning several files are split into one range per file.
pub fn prep_log_buffer(
    snapshot: &JobSnapshot,
    registry: &FileRegistry,
    sequence: u64,
) -> Result<PreparedSection, DurError> {
    let mut pieces: Vec<MappedRange> = Vec::with_capacity(snapshot.intents.len());
    for intent in &snapshot.intents {
        pieces.extend(registry.resolve(intent.start(), intent.len())?);
    }

    let mut files: Vec<SectionFile> = Vec::new();
    let mut index_of: HashMap<FileId, u16> = HashMap::new();
    for piece in &pieces {
        let id = piece.file.id();
        if !index_of.contains_key(&id) {
            let index = u16::try_from(files.len()).map_err(|_| {
                DurError::InvalidState(format!("commit touches more than {} files", u16::MAX))
            })?;
            index_of.insert(id, index);
            files.push(SectionFile {
                file_id: id.0,
                name: piece.file.name().to_string(),
            });
        }
    }

    let payload: u64 = pieces.iter().map(|p| p.len).sum();
    let capacity = payload as usize + pieces.len() * RANGE_HEADER_BYTES + 256;
    let mut writer = SectionWriter::with_capacity(&files, &snapshot.ops, capacity)?;

    for piece in &pieces {
        let index = index_of[&piece.file.id()];
        let mut offset = piece.offset;
        let end = piece.offset + piece.len;
        while offset < end {
            let len = (end - offset).min(u32::MAX as u64) as u32;
            writer.push_range_with(index, offset, len, |buf| {
                piece.file.read_private(offset, buf)
            })?;
            offset += len as u64;
        }
    }

    tracing::trace!(
        "Prepared section {}: {} intents in {} ranges over {} files, {} bytes",
        sequence,
        snapshot.intents.len(),
        writer.range_count(),
        files.len(),
        writer.range_bytes()
    );
    Ok(writer.finish(sequence, now_millis()))
}
