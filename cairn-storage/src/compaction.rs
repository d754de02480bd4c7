//! # Compaction
//!
//! Rewrites a storage file keeping only the live version of each key.
//!
//! ```text
//!   objects.cairn ── scan ──► winners ── copy ──► objects.cairn.tmp
//!                                                    │ fsync
//!   objects.cairn ◄──────────── rename ──────────────┘
//!                               fsync dir
//! ```
//!
//! The original stays untouched until the rename, so a crash at any point
//! leaves either the old file or the new one.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use tracing::info;

use cairn_core::error::{Error, Result, ResultExt};

use crate::block::BlockStatus;
use crate::scan::{scan_blocks, ScanReport};
use crate::storage::resolve_latest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub blocks_kept: u64,
    pub blocks_dropped: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Scan of the original file, including any corruption that was dropped.
    pub scan: ScanReport,
}

/// Compact `dir/storage_file` through `dir/temp_file`.
///
/// Keeps one Active block per key (highest transaction id), preserving
/// its bytes and relative order. Invalid, Dirty and Deleted blocks are
/// dropped. Running it on an already compacted file reproduces it byte for
/// byte.
pub fn compact_and_repair(dir: &Path, storage_file: &str, temp_file: &str) -> Result<CompactionReport> {
    let started = Instant::now();
    let source_path = dir.join(storage_file);
    let temp_path = dir.join(temp_file);
    if source_path == temp_path {
        return Err(Error::Compaction {
            reason: "temp file must differ from the storage file".to_string(),
        });
    }

    let mut source = File::open(&source_path)
        .with_context(|| format!("Failed to open {:?} for compaction", source_path))?;
    let (blocks, scan) = scan_blocks(&source, 0, false)?;
    let latest = resolve_latest(&blocks);

    let temp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create {:?}", temp_path))?;
    let mut writer = BufWriter::new(temp);

    let mut report = CompactionReport {
        bytes_before: scan.file_bytes,
        ..Default::default()
    };
    let mut buf = Vec::new();

    for block in &blocks {
        let keep = block.status == BlockStatus::Active
            && latest
                .get(block.primary_key.as_str())
                .map_or(false, |w| w.offset == block.offset);
        if !keep {
            report.blocks_dropped += 1;
            continue;
        }

        buf.resize(block.length as usize, 0);
        source.seek(SeekFrom::Start(block.offset))?;
        source.read_exact(&mut buf)?;
        writer.write_all(&buf)?;
        report.blocks_kept += 1;
        report.bytes_after += block.length as u64;
    }
    report.blocks_dropped += scan.invalid_blocks;

    let temp = writer.into_inner().map_err(|e| Error::Compaction {
        reason: format!("failed to flush {:?}: {}", temp_path, e),
    })?;
    temp.sync_all()?;
    drop(temp);
    drop(source);

    std::fs::rename(&temp_path, &source_path)
        .with_context(|| format!("Failed to replace {:?}", source_path))?;
    sync_dir(dir)?;
    report.scan = scan;

    info!(
        "Compacted {:?}: kept {} blocks, dropped {}, {} -> {} bytes in {:?}",
        source_path,
        report.blocks_kept,
        report.blocks_dropped,
        report.bytes_before,
        report.bytes_after,
        started.elapsed()
    );
    Ok(report)
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
