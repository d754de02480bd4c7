use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};

use tracing::{debug, warn};

use cairn_core::error::{Error, Result};

use super::file::read_transaction;
use super::types::{LogRecord, LOG_BEGIN_MARKER};
use crate::scan::find_next_marker;

/// Streaming iterator over log records.
///
/// Damaged records are skipped by searching for the next begin marker; the
/// offsets skipped and any truncated tail are kept for the caller.
pub struct LogRecordIterator {
    reader: BufReader<File>,
    pos: u64,
    file_len: u64,
    done: bool,
    pub corrupt_offsets: Vec<u64>,
    /// Start of an interrupted final write.
    pub truncated_at: Option<u64>,
}

impl LogRecordIterator {
    pub(crate) fn new(file: File, start: u64) -> Result<Self> {
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            pos: start,
            file_len,
            done: false,
            corrupt_offsets: Vec::new(),
            truncated_at: None,
        })
    }

    fn resync(&mut self, from: u64) -> Result<Option<u64>> {
        find_next_marker(&mut self.reader, LOG_BEGIN_MARKER, from + 1, self.file_len)
    }
}

impl Iterator for LogRecordIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < self.file_len {
            if let Err(e) = self.reader.seek(SeekFrom::Start(self.pos)) {
                self.done = true;
                return Some(Err(e.into()));
            }

            match read_transaction(&mut self.reader) {
                Ok(Some(record)) => {
                    self.pos += record.length as u64;
                    return Some(Ok(record));
                }
                Ok(None) => break,
                Err(Error::TruncatedRecord { offset }) => match self.resync(offset) {
                    // a later record exists, so this one was damaged rather than cut
                    Ok(Some(next)) => {
                        debug!("Damaged log record at {}, resuming at {}", offset, next);
                        self.corrupt_offsets.push(offset);
                        self.pos = next;
                    }
                    Ok(None) => {
                        warn!("Truncated log record at offset {}", offset);
                        self.truncated_at = Some(offset);
                        self.done = true;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Err(Error::Corruption { offset, details }) => match self.resync(offset) {
                    Ok(Some(next)) => {
                        warn!("Corrupt log record at {} ({}), resuming at {}", offset, details, next);
                        self.corrupt_offsets.push(offset);
                        self.pos = next;
                    }
                    Ok(None) => {
                        warn!("Corrupt log record at {} ({}), nothing follows", offset, details);
                        self.corrupt_offsets.push(offset);
                        self.truncated_at = Some(offset);
                        self.done = true;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
