//! # Reliable Storage
//!
//! Append-only block file with an in-memory primary key → location index.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  put / apply                                                │
//! │    1. append new blocks at end of file      (fsync)         │
//! │    2. flip superseded blocks to Dirty       (status byte)   │
//! │    3. update index                                          │
//! │                                                             │
//! │  delete                                                     │
//! │    flip live block to Deleted, drop from index              │
//! │                                                             │
//! │  open                                                       │
//! │    scan → highest transaction id per key wins → repair      │
//! │    duplicates left by a crash between steps 1 and 2         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
#[cfg(feature = "fault-injection")]
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use cairn_core::{
    config::StorageConfig,
    error::{Error, Result, ResultExt},
    metrics::Metrics,
    Mutation,
};

use crate::block::{BlockStatus, PersistentBlock, STATUS_OFFSET};
use crate::compaction::{compact_and_repair, CompactionReport};
use crate::scan::{scan_blocks, ScanReport, ScannedBlock};

/// Where the live block for a key sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub offset: u64,
    pub length: u32,
    pub transaction_id: u64,
}

struct StorageInner {
    file: File,
    index: HashMap<String, BlockLocation>,
    end_offset: u64,
    next_transaction_id: u64,
    /// Bytes held by Dirty, Deleted or invalid blocks.
    dead_bytes: u64,
}

pub struct ReliableStorage {
    dir: PathBuf,
    path: PathBuf,
    config: StorageConfig,
    metrics: Metrics,
    inner: Mutex<StorageInner>,
    #[cfg(feature = "fault-injection")]
    apply_faults: AtomicU32,
}

impl ReliableStorage {
    /// Open or create the storage file described by `config`.
    ///
    /// Returns the scan report of the initial load so callers can surface
    /// corruption.
    pub fn open(config: StorageConfig, metrics: Metrics) -> Result<(Self, ScanReport)> {
        let dir = config.data_dir.clone();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {:?}", dir))?;

        let path = dir.join(&config.storage_file);
        let temp_path = dir.join(&config.temp_file);
        if temp_path.exists() {
            // leftover from an interrupted compaction, the original is intact
            warn!("Removing stale compaction file {:?}", temp_path);
            std::fs::remove_file(&temp_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open storage file: {:?}", path))?;

        let (inner, report) = Self::load(file, &metrics)?;
        info!(
            "Opened storage {:?}: {} live keys, {} valid blocks, {} invalid",
            path,
            inner.index.len(),
            report.valid_blocks,
            report.invalid_blocks
        );

        Ok((
            Self {
                dir,
                path,
                config,
                metrics,
                inner: Mutex::new(inner),
                #[cfg(feature = "fault-injection")]
                apply_faults: AtomicU32::new(0),
            },
            report,
        ))
    }

    fn load(mut file: File, metrics: &Metrics) -> Result<(StorageInner, ScanReport)> {
        let (blocks, report) = scan_blocks(&file, 0, false)?;
        if report.invalid_blocks > 0 {
            metrics.record_corruption(report.invalid_blocks);
        }

        let resolved = resolve_latest(&blocks);
        let mut index = HashMap::with_capacity(resolved.len());
        let mut dead_bytes = report.invalid_bytes;
        let mut stale = Vec::new();

        for block in &blocks {
            let winner = resolved.get(block.primary_key.as_str());
            let is_winner = winner.map_or(false, |w| w.offset == block.offset);
            match block.status {
                BlockStatus::Active if is_winner => {
                    index.insert(
                        block.primary_key.clone(),
                        BlockLocation {
                            offset: block.offset,
                            length: block.length,
                            transaction_id: block.last_transaction_id,
                        },
                    );
                }
                BlockStatus::Active => {
                    stale.push(block.offset);
                    dead_bytes += block.length as u64;
                }
                _ => dead_bytes += block.length as u64,
            }
        }

        for offset in &stale {
            debug!("Repairing superseded active block at offset {}", offset);
            write_status(&mut file, *offset, BlockStatus::Dirty)?;
        }
        if !stale.is_empty() {
            file.sync_data()?;
        }

        let mut end_offset = report.file_bytes;
        if let Some(garbage) = report.trailing_garbage_from {
            warn!(
                "Truncating {} bytes of trailing garbage at offset {}",
                end_offset - garbage,
                garbage
            );
            file.set_len(garbage)?;
            file.sync_all()?;
            dead_bytes -= end_offset - garbage;
            end_offset = garbage;
        }

        let next_transaction_id = blocks
            .iter()
            .map(|b| b.last_transaction_id)
            .max()
            .unwrap_or(0)
            + 1;

        Ok((
            StorageInner {
                file,
                index,
                end_offset,
                next_transaction_id,
                dead_bytes,
            },
            report,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the live payload for a key.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        let location = match inner.index.get(key) {
            Some(location) => *location,
            None => return Ok(None),
        };
        let block = read_block_at(&mut inner.file, location)?;
        Ok(block.payload)
    }

    pub fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Bytes)>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(payload) = self.get(key)? {
                found.push((key.clone(), payload));
            }
        }
        Ok(found)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    pub fn location(&self, key: &str) -> Option<BlockLocation> {
        self.inner.lock().index.get(key).copied()
    }

    /// Sorted live keys, optionally restricted to a prefix.
    pub fn keys(&self, prefix: Option<&str>) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .index
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live object, sorted by key.
    pub fn live_items(&self, prefix: Option<&str>) -> Result<Vec<(String, Bytes)>> {
        let keys = self.keys(prefix);
        self.get_many(&keys)
    }

    /// Insert or replace one object. Returns the block transaction id.
    pub fn put(&self, key: impl Into<String>, payload: Bytes) -> Result<u64> {
        let ids = self.upsert(vec![(key.into(), payload)])?;
        ids.first().copied().ok_or_else(|| Error::Internal {
            message: "append returned no block".to_string(),
        })
    }

    /// Append blocks for `items`, checking existence first.
    ///
    /// With `is_update` every key must already exist (`KeyNotFound`
    /// otherwise); without it every key must be new (`DuplicateKey`). A
    /// failed check writes nothing. Returns the transaction id assigned to
    /// each block.
    pub fn put_many(&self, items: Vec<(String, Bytes)>, is_update: bool) -> Result<Vec<u64>> {
        let mut inner = self.inner.lock();
        for (key, _) in &items {
            match (is_update, inner.index.contains_key(key)) {
                (true, false) => return Err(Error::KeyNotFound { key: key.clone() }),
                (false, true) => return Err(Error::DuplicateKey { key: key.clone() }),
                _ => {}
            }
        }
        self.append_locked(&mut inner, items)
    }

    /// Append blocks for `items` whether or not the keys exist.
    pub fn upsert(&self, items: Vec<(String, Bytes)>) -> Result<Vec<u64>> {
        let mut inner = self.inner.lock();
        self.append_locked(&mut inner, items)
    }

    /// Apply staged mutations in order. Later mutations of a key win.
    pub fn apply(&self, mutations: &[Mutation]) -> Result<()> {
        #[cfg(feature = "fault-injection")]
        self.take_apply_fault()?;

        let mut last: HashMap<&str, usize> = HashMap::new();
        for (i, m) in mutations.iter().enumerate() {
            last.insert(m.key(), i);
        }

        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (i, m) in mutations.iter().enumerate() {
            if last.get(m.key()) != Some(&i) {
                continue;
            }
            match m {
                Mutation::Put { key, payload } => puts.push((key.clone(), payload.clone())),
                Mutation::Delete { key } => deletes.push(key.clone()),
            }
        }

        let mut inner = self.inner.lock();
        if !puts.is_empty() {
            self.append_locked(&mut inner, puts)?;
        }
        if !deletes.is_empty() {
            self.delete_locked(&mut inner, &deletes)?;
        }
        Ok(())
    }

    /// Fail the next `count` calls to [`apply`](Self::apply) before they
    /// touch the file.
    #[cfg(feature = "fault-injection")]
    pub fn inject_apply_faults(&self, count: u32) {
        self.apply_faults.store(count, Ordering::SeqCst);
    }

    #[cfg(feature = "fault-injection")]
    fn take_apply_fault(&self) -> Result<()> {
        let due = self
            .apply_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if due {
            warn!("injected apply fault on {:?}", self.path);
            return Err(Error::Io {
                message: "injected apply fault".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected apply fault"),
            });
        }
        Ok(())
    }

    /// Tombstone keys. Missing keys are ignored; returns how many were live.
    pub fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.delete_locked(&mut inner, keys)
    }

    /// Tombstone every live key.
    pub fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner.index.keys().cloned().collect();
        self.delete_locked(&mut inner, &keys)
    }

    fn append_locked(&self, inner: &mut StorageInner, items: Vec<(String, Bytes)>) -> Result<Vec<u64>> {
        if items.is_empty() {
            return Ok(vec![]);
        }

        let mut buffer = Vec::new();
        let mut placed = Vec::with_capacity(items.len());
        for (key, payload) in items {
            let transaction_id = inner.next_transaction_id;
            inner.next_transaction_id += 1;

            let block = PersistentBlock::new(key, payload, transaction_id);
            let offset = inner.end_offset + buffer.len() as u64;
            let length = block.write(&mut buffer)?;
            placed.push((
                block.primary_key,
                BlockLocation {
                    offset,
                    length,
                    transaction_id,
                },
            ));
        }

        let end = inner.end_offset;
        inner.file.seek(SeekFrom::Start(end))?;
        inner
            .file
            .write_all(&buffer)
            .with_context(|| format!("Failed to append to {:?}", self.path))?;
        if self.config.sync_writes {
            inner.file.sync_data()?;
        }
        inner.end_offset += buffer.len() as u64;
        self.metrics.record_block_write(buffer.len() as u64);

        // new blocks are durable, now retire the versions they replace
        let mut superseded = false;
        let mut ids = Vec::with_capacity(placed.len());
        for (key, location) in placed {
            ids.push(location.transaction_id);
            if let Some(old) = inner.index.insert(key, location) {
                write_status(&mut inner.file, old.offset, BlockStatus::Dirty)?;
                inner.dead_bytes += old.length as u64;
                superseded = true;
            }
        }
        if superseded && self.config.sync_writes {
            inner.file.sync_data()?;
        }
        Ok(ids)
    }

    fn delete_locked(&self, inner: &mut StorageInner, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if let Some(old) = inner.index.remove(key) {
                write_status(&mut inner.file, old.offset, BlockStatus::Deleted)?;
                inner.dead_bytes += old.length as u64;
                deleted += 1;
            }
        }
        if deleted > 0 && self.config.sync_writes {
            inner.file.sync_data()?;
        }
        Ok(deleted)
    }

    /// Fraction of the file occupied by dead blocks.
    pub fn dirty_ratio(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.end_offset == 0 {
            0.0
        } else {
            inner.dead_bytes as f64 / inner.end_offset as f64
        }
    }

    pub fn file_size(&self) -> u64 {
        self.inner.lock().end_offset
    }

    /// Rescan the open file without modifying it.
    pub fn scan(&self, header_only: bool) -> Result<ScanReport> {
        let inner = self.inner.lock();
        let (_, report) = scan_blocks(&inner.file, 0, header_only)?;
        Ok(report)
    }

    /// Compact the open file in place and reload the index.
    pub fn compact(&self) -> Result<CompactionReport> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;

        let report = compact_and_repair(&self.dir, &self.config.storage_file, &self.config.temp_file)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to reopen storage file: {:?}", self.path))?;
        let (reloaded, _) = Self::load(file, &self.metrics)?;
        *inner = reloaded;

        self.metrics
            .record_compaction(report.bytes_before.saturating_sub(report.bytes_after));
        Ok(report)
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

/// For each key, the block with the highest transaction id (later offset on ties).
pub(crate) fn resolve_latest(blocks: &[ScannedBlock]) -> HashMap<&str, &ScannedBlock> {
    let mut latest: HashMap<&str, &ScannedBlock> = HashMap::new();
    for block in blocks {
        latest
            .entry(block.primary_key.as_str())
            .and_modify(|current| {
                if (block.last_transaction_id, block.offset)
                    > (current.last_transaction_id, current.offset)
                {
                    *current = block;
                }
            })
            .or_insert(block);
    }
    latest
}

fn write_status(file: &mut File, offset: u64, status: BlockStatus) -> Result<()> {
    file.seek(SeekFrom::Start(offset + STATUS_OFFSET))?;
    file.write_all(&[status as u8])?;
    Ok(())
}

fn read_block_at(file: &mut File, location: BlockLocation) -> Result<PersistentBlock> {
    let mut buf = vec![0u8; location.length as usize];
    file.seek(SeekFrom::Start(location.offset))?;
    file.read_exact(&mut buf)?;

    let corrupt = || Error::Corruption {
        offset: location.offset,
        details: "indexed block failed validation".to_string(),
    };
    let block = PersistentBlock::read(&mut Cursor::new(&buf), false)?.ok_or_else(corrupt)?;
    if !block.is_active() {
        return Err(corrupt());
    }
    Ok(block)
}
