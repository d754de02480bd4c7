//! Transaction log for two-stage commits.
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Record Lifecycle                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  stage ──► ToProcess ──┬── commit ──► Processing ──► Processed  │
//! │                        └── abort ───► Canceled                  │
//! │                                                                 │
//! │  Restart:  ToProcess  → Canceled (no decision was received)     │
//! │            Processing → redo mutations, then Processed          │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! File Format
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Log File Layout                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Header (8 bytes)  offset of oldest unresolved record       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Record                                                     │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Begin Marker (8) │ Length (4) │ Status (1)          │    │
//! │  │ Txn Id (8) │ Timestamp ms (8) │ Mutation Count (4)  │    │
//! │  ├─────────────────────────────────────────────────────┤    │
//! │  │ Mutations: kind (1) │ key len (4) │ key │           │    │
//! │  │            payload len (4) │ payload                │    │
//! │  ├─────────────────────────────────────────────────────┤    │
//! │  │ CRC32 (4) over txn id..mutations │ End Marker (8)   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘

mod file;
mod iterator;
mod types;

pub use file::read_transaction;
pub use iterator::LogRecordIterator;
pub use types::{LogRecord, LogStatus, RecoveryPlan, LOG_HEADER_SIZE};

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use cairn_core::{
    config::TransactionLogConfig,
    error::{Error, Result, ResultExt},
    metrics::Metrics,
    Mutation, TransactionId,
};

use crate::compaction::sync_dir;
use file::encode_record;
use types::RECORD_STATUS_OFFSET;

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    transaction_id: TransactionId,
    status: LogStatus,
}

struct LogInner {
    file: File,
    /// Records at or after `first_unresolved`, by offset.
    entries: BTreeMap<u64, EntryMeta>,
    by_transaction: HashMap<TransactionId, u64>,
    first_unresolved: u64,
    end_offset: u64,
}

pub struct TransactionLog {
    dir: PathBuf,
    path: PathBuf,
    config: TransactionLogConfig,
    metrics: Metrics,
    inner: Mutex<LogInner>,
}

impl TransactionLog {
    /// Open or create the log in `dir` and resolve what the last run left.
    ///
    /// Undecided records are canceled on disk before this returns. Records
    /// in `RecoveryPlan::redo` must be passed to [`TransactionLog::replay`].
    pub fn open(
        dir: impl AsRef<Path>,
        config: TransactionLogConfig,
        metrics: Metrics,
    ) -> Result<(Self, RecoveryPlan)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
        let path = dir.join(&config.file_name);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open transaction log: {:?}", path))?;

        let len = file.metadata()?.len();
        if len < LOG_HEADER_SIZE {
            if len > 0 {
                warn!("Transaction log {:?} has a torn header, starting empty", path);
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_u64::<LittleEndian>(LOG_HEADER_SIZE)?;
            file.sync_all()?;
        }

        file.seek(SeekFrom::Start(0))?;
        let mut start = file.read_u64::<LittleEndian>()?;
        let len = file.metadata()?.len();
        if start < LOG_HEADER_SIZE || start > len {
            warn!("Log header offset {} out of range, scanning from the start", start);
            start = LOG_HEADER_SIZE;
        }

        let mut plan = RecoveryPlan::default();
        let mut entries = BTreeMap::new();
        let mut by_transaction = HashMap::new();
        let mut to_cancel = Vec::new();

        let mut iter = LogRecordIterator::new(file.try_clone()?, start)?;
        for record in iter.by_ref() {
            let record = record?;
            match record.status {
                LogStatus::ToProcess => {
                    to_cancel.push(record.offset);
                    plan.discarded.push(record.transaction_id);
                }
                LogStatus::Processing => plan.redo.push(record.clone()),
                LogStatus::Processed | LogStatus::Canceled => {}
            }
            let status = if record.status == LogStatus::ToProcess {
                LogStatus::Canceled
            } else {
                record.status
            };
            entries.insert(
                record.offset,
                EntryMeta {
                    transaction_id: record.transaction_id,
                    status,
                },
            );
            by_transaction.insert(record.transaction_id, record.offset);
        }
        plan.corrupt_records = iter.corrupt_offsets.len() as u64;

        for offset in &to_cancel {
            write_status_byte(&mut file, *offset, LogStatus::Canceled)?;
        }

        let mut end_offset = len;
        if let Some(cut) = iter.truncated_at {
            plan.truncated_bytes = len - cut;
            file.set_len(cut)?;
            end_offset = cut;
        }
        file.sync_all()?;

        if !plan.is_empty() {
            info!(
                "Recovered transaction log {:?}: {} to redo, {} canceled, {} corrupt, {} bytes truncated",
                path,
                plan.redo.len(),
                plan.discarded.len(),
                plan.corrupt_records,
                plan.truncated_bytes
            );
        }
        metrics.record_recovery(0, plan.discarded.len() as u64);

        Ok((
            Self {
                dir,
                path,
                config,
                metrics,
                inner: Mutex::new(LogInner {
                    file,
                    entries,
                    by_transaction,
                    first_unresolved: start,
                    end_offset,
                }),
            },
            plan,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply every record to redo and mark it Processed.
    pub fn replay<F>(&self, plan: &RecoveryPlan, mut apply: F) -> Result<u64>
    where
        F: FnMut(&LogRecord) -> Result<()>,
    {
        let mut replayed = 0;
        for record in &plan.redo {
            debug!("Replaying {} ({} mutations)", record.transaction_id, record.mutations.len());
            apply(record)?;
            self.set_status(record.transaction_id, LogStatus::Processed)?;
            replayed += 1;
        }
        self.metrics.record_recovery(replayed, 0);
        Ok(replayed)
    }

    /// Stage a transaction with status ToProcess. Returns the record offset.
    pub fn append(&self, transaction_id: TransactionId, mutations: &[Mutation]) -> Result<u64> {
        let buf = encode_record(transaction_id, now_ms(), LogStatus::ToProcess, mutations)?;

        let mut inner = self.inner.lock();
        if inner.by_transaction.contains_key(&transaction_id) {
            return Err(Error::TransactionLog {
                message: format!("{} is already in the log", transaction_id),
            });
        }

        let offset = inner.end_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner
            .file
            .write_all(&buf)
            .with_context(|| format!("Failed to append {} to the log", transaction_id))?;
        if self.config.sync_on_write {
            inner.file.sync_data()?;
        }

        inner.end_offset += buf.len() as u64;
        inner.entries.insert(
            offset,
            EntryMeta {
                transaction_id,
                status: LogStatus::ToProcess,
            },
        );
        inner.by_transaction.insert(transaction_id, offset);
        Ok(offset)
    }

    /// Move a record to `status`, rejecting illegal transitions.
    pub fn set_status(&self, transaction_id: TransactionId, status: LogStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        let offset = *inner
            .by_transaction
            .get(&transaction_id)
            .ok_or_else(|| Error::TransactionLog {
                message: format!("{} is not in the log", transaction_id),
            })?;
        let current = inner
            .entries
            .get(&offset)
            .map(|e| e.status)
            .ok_or_else(|| Error::Internal {
                message: format!("log index lost the record of {}", transaction_id),
            })?;

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                transaction_id: transaction_id.0,
                from: format!("{:?}", current),
                to: format!("{:?}", status),
            });
        }

        write_status_byte(&mut inner.file, offset, status)?;
        if self.config.sync_on_write {
            inner.file.sync_data()?;
        }
        if let Some(entry) = inner.entries.get_mut(&offset) {
            entry.status = status;
        }
        Ok(())
    }

    pub fn status_of(&self, transaction_id: TransactionId) -> Option<LogStatus> {
        let inner = self.inner.lock();
        let offset = inner.by_transaction.get(&transaction_id)?;
        inner.entries.get(offset).map(|e| e.status)
    }

    /// Whether any commit is still being applied to storage.
    pub fn has_processing(&self) -> bool {
        self.inner
            .lock()
            .entries
            .values()
            .any(|e| e.status == LogStatus::Processing)
    }

    /// Unresolved records in log order.
    pub fn unresolved(&self) -> Vec<(TransactionId, LogStatus)> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| !e.status.is_resolved())
            .map(|e| (e.transaction_id, e.status))
            .collect()
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().end_offset
    }

    /// Records from the header offset onwards, read back from disk.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        let (file, start) = {
            let inner = self.inner.lock();
            (inner.file.try_clone()?, inner.first_unresolved)
        };
        LogRecordIterator::new(file, start)?.collect()
    }

    /// Advance the header past the leading run of resolved records.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let next = inner
            .entries
            .iter()
            .find(|(_, e)| !e.status.is_resolved())
            .map(|(offset, _)| *offset)
            .unwrap_or(inner.end_offset);

        if next <= inner.first_unresolved {
            return Ok(inner.first_unresolved);
        }

        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_u64::<LittleEndian>(next)?;
        inner.file.sync_data()?;

        let retained = inner.entries.split_off(&next);
        for entry in inner.entries.values() {
            let id = entry.transaction_id;
            inner.by_transaction.remove(&id);
        }
        inner.entries = retained;
        inner.first_unresolved = next;
        debug!("Log checkpoint advanced to offset {}", next);
        Ok(next)
    }

    /// Rewrite the log without the checkpointed prefix once it exceeds
    /// `max_size`. Returns whether a rewrite happened.
    pub fn rotate(&self) -> Result<bool> {
        if self.size() <= self.config.max_size {
            return Ok(false);
        }
        self.checkpoint()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let start = inner.first_unresolved;
        if start <= LOG_HEADER_SIZE {
            return Ok(false);
        }
        let shift = start - LOG_HEADER_SIZE;

        let temp_path = self.dir.join(format!("{}.rotate", self.config.file_name));
        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create {:?}", temp_path))?;
        temp.write_u64::<LittleEndian>(LOG_HEADER_SIZE)?;

        let tail_len = inner.end_offset - start;
        let mut tail = Vec::with_capacity(tail_len as usize);
        inner.file.seek(SeekFrom::Start(start))?;
        (&mut inner.file).take(tail_len).read_to_end(&mut tail)?;
        temp.write_all(&tail)?;
        temp.sync_all()?;
        drop(temp);

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        sync_dir(&self.dir)?;

        inner.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to reopen {:?}", self.path))?;

        let entries = std::mem::take(&mut inner.entries);
        inner.entries = entries.into_iter().map(|(o, e)| (o - shift, e)).collect();
        inner.by_transaction = inner
            .entries
            .iter()
            .map(|(o, e)| (e.transaction_id, *o))
            .collect();
        inner.first_unresolved = LOG_HEADER_SIZE;
        inner.end_offset -= shift;

        info!("Rotated transaction log {:?}, dropped {} bytes", self.path, shift);
        Ok(true)
    }
}

fn write_status_byte(file: &mut File, offset: u64, status: LogStatus) -> Result<()> {
    file.seek(SeekFrom::Start(offset + RECORD_STATUS_OFFSET))?;
    file.write_all(&[status as u8])?;
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
