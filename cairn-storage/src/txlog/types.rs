use cairn_core::{
    error::{Error, Result},
    Mutation, TransactionId,
};

pub const LOG_BEGIN_MARKER: u64 = 0x7A4C_06C0_0000_0B16;
pub const LOG_END_MARKER: u64 = 0x7A4C_06C0_0000_0E7D;

/// Header: offset of the first record that may still be unresolved.
pub const LOG_HEADER_SIZE: u64 = 8;
/// Offset of the status byte from the record start.
pub const RECORD_STATUS_OFFSET: u64 = 12;
/// begin + len + status + txn id + timestamp + mutation count
pub const RECORD_HEADER_SIZE: usize = 8 + 4 + 1 + 8 + 8 + 4;
/// crc + end
pub const RECORD_TRAILER_SIZE: usize = 4 + 8;
pub const MAX_RECORD_SIZE: usize = 512 * 1024 * 1024;

pub const MUTATION_PUT: u8 = 1;
pub const MUTATION_DELETE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogStatus {
    /// Staged, waiting for the decision.
    ToProcess = 1,
    /// Commit decided, storage writes may be in flight.
    Processing = 2,
    Processed = 3,
    Canceled = 4,
}

impl LogStatus {
    pub fn is_resolved(self) -> bool {
        matches!(self, LogStatus::Processed | LogStatus::Canceled)
    }

    pub fn can_transition_to(self, next: LogStatus) -> bool {
        matches!(
            (self, next),
            (LogStatus::ToProcess, LogStatus::Processing)
                | (LogStatus::ToProcess, LogStatus::Canceled)
                | (LogStatus::Processing, LogStatus::Processed)
        )
    }
}

impl TryFrom<u8> for LogStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogStatus::ToProcess),
            2 => Ok(LogStatus::Processing),
            3 => Ok(LogStatus::Processed),
            4 => Ok(LogStatus::Canceled),
            _ => Err(Error::TransactionLog {
                message: format!("Invalid record status: {}", value),
            }),
        }
    }
}

/// One staged transaction as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: u64,
    pub transaction_id: TransactionId,
    pub status: LogStatus,
    pub timestamp_ms: u64,
    pub mutations: Vec<Mutation>,
    /// Encoded size in bytes.
    pub length: u32,
}

/// Outcome of reading the log at open.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    /// Commit was decided but may not have reached storage.
    pub redo: Vec<LogRecord>,
    /// Staged without a decision, now Canceled.
    pub discarded: Vec<TransactionId>,
    pub corrupt_records: u64,
    /// Bytes cut from an interrupted final write.
    pub truncated_bytes: u64,
}

impl RecoveryPlan {
    pub fn is_empty(&self) -> bool {
        self.redo.is_empty()
            && self.discarded.is_empty()
            && self.corrupt_records == 0
            && self.truncated_bytes == 0
    }
}
