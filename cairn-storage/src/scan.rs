//! # Block Scanner
//!
//! Linear pass over a storage file. Corrupt blocks are recorded and skipped
//! by searching for the next begin marker, so a scan always reaches the end.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use cairn_core::error::{Result, ResultExt};

use crate::block::{BlockStatus, PersistentBlock, BEGIN_MARKER, MIN_BLOCK_SIZE};

const SEARCH_CHUNK: usize = 64 * 1024;

/// Header of one valid block seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedBlock {
    pub offset: u64,
    pub length: u32,
    pub status: BlockStatus,
    pub primary_key: String,
    pub last_transaction_id: u64,
}

/// Completeness and validity summary of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub valid_blocks: u64,
    pub invalid_blocks: u64,
    pub active_blocks: u64,
    pub dirty_blocks: u64,
    pub deleted_blocks: u64,
    /// Start offsets of every invalid region.
    pub invalid_offsets: Vec<u64>,
    /// Bytes not covered by a valid block.
    pub invalid_bytes: u64,
    pub file_bytes: u64,
    /// Offset where trailing garbage starts, if no valid block follows it.
    pub trailing_garbage_from: Option<u64>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_blocks == 0
    }
}

/// Scan an open file from `start` to its end.
///
/// With `header_only` the payload checksums are not verified.
pub(crate) fn scan_blocks(
    file: &File,
    start: u64,
    header_only: bool,
) -> Result<(Vec<ScannedBlock>, ScanReport)> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut blocks = Vec::new();
    let mut report = ScanReport {
        file_bytes: file_len,
        ..Default::default()
    };

    let mut pos = start;
    while pos < file_len {
        reader.seek(SeekFrom::Start(pos))?;
        let block = match PersistentBlock::read(&mut reader, header_only)? {
            Some(block) => block,
            None => break,
        };

        if block.is_valid_block() {
            report.valid_blocks += 1;
            match block.status {
                BlockStatus::Active => report.active_blocks += 1,
                BlockStatus::Dirty => report.dirty_blocks += 1,
                BlockStatus::Deleted => report.deleted_blocks += 1,
            }
            pos += block.length as u64;
            blocks.push(ScannedBlock {
                offset: block.index,
                length: block.length,
                status: block.status,
                primary_key: block.primary_key,
                last_transaction_id: block.last_transaction_id,
            });
            continue;
        }

        report.invalid_blocks += 1;
        report.invalid_offsets.push(pos);

        let next = find_next_marker(&mut reader, BEGIN_MARKER, pos + MIN_BLOCK_SIZE as u64, file_len)?;
        match next {
            Some(next) => {
                debug!("Invalid block at offset {}, resuming at {}", pos, next);
                report.invalid_bytes += next - pos;
                pos = next;
            }
            None => {
                warn!("Invalid block at offset {}, no further blocks", pos);
                report.invalid_bytes += file_len - pos;
                report.trailing_garbage_from = Some(pos);
                break;
            }
        }
    }

    Ok((blocks, report))
}

/// Find the first occurrence of `marker` at or after `from`.
pub(crate) fn find_next_marker<R: Read + Seek>(
    reader: &mut R,
    marker: u64,
    from: u64,
    file_len: u64,
) -> Result<Option<u64>> {
    let needle = marker.to_le_bytes();
    if from >= file_len {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(from))?;
    let mut chunk_start = from;
    let mut window: Vec<u8> = Vec::with_capacity(SEARCH_CHUNK + needle.len());
    let mut buf = vec![0u8; SEARCH_CHUNK];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        window.extend_from_slice(&buf[..n]);

        if let Some(at) = window.windows(needle.len()).position(|w| w == needle) {
            return Ok(Some(chunk_start + at as u64));
        }

        // keep a tail so markers split across reads are still found
        let keep = needle.len() - 1;
        if window.len() > keep {
            let drop = window.len() - keep;
            window.drain(..drop);
            chunk_start += drop as u64;
        }
    }
}

/// Offline analysis of a storage file that is not open.
pub fn analyze(path: impl AsRef<Path>, header_only: bool) -> Result<ScanReport> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let (_, report) = scan_blocks(&file, 0, header_only)?;
    Ok(report)
}
