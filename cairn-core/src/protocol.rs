//! # Wire Protocol
//!
//! Closed request and response sets exchanged between clients and shard nodes.
//!
//! ```text
//! Request ─┬─ DataAccess   get / put / delete / update-if / transaction / lock
//!          ├─ Admin        declare / dump / import / mode / stop / drop / compact / analyze
//!          ├─ UniqueId     generate / resync
//!          └─ Continue     commit-or-abort decision for a staged transaction
//!
//! Response ─┬─ Data        a chunk of objects or an admin report
//!           ├─ Exception   kind + message + server-side context
//!           ├─ Null        end of a logical answer
//!           └─ Ready       participant staged the transaction durably
//! ```
//!
//! Frames on a byte transport are MessagePack encoded with `rmp-serde`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ObjectKey, Operation, ResourceKey, TransactionId};

/// Top-level request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    DataAccess(DataRequest),
    Admin(AdminRequest),
    UniqueId(UniqueIdRequest),
    Continue(ContinueRequest),
}

/// Object-level operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRequest {
    Get {
        collection: String,
        keys: Vec<String>,
    },
    Put {
        collection: String,
        items: Vec<(String, Bytes)>,
    },
    Delete {
        collection: String,
        keys: Vec<String>,
    },
    UpdateIf {
        key: ObjectKey,
        expected: Bytes,
        payload: Bytes,
    },
    /// Begin-transaction: stage `operations` and answer `Ready`.
    Transaction {
        transaction_id: TransactionId,
        operations: Vec<Operation>,
    },
    /// Session-scoped pessimistic lock.
    Lock {
        resources: Vec<ResourceKey>,
        timeout_ms: u64,
    },
    /// Release every lock the session holds.
    Unlock,
}

/// Administrative operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Register a collection (type registration).
    DeclareCollection { name: String },
    /// Stream every live object of every collection.
    Dump,
    /// Bulk load objects, replacing existing ones.
    Import {
        collection: String,
        items: Vec<(String, Bytes)>,
    },
    SwitchMode { read_only: bool },
    Stop,
    /// Delete every object. With `collection` set, only that collection.
    Drop { collection: Option<String> },
    Compact,
    Analyze,
}

/// Unique id generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniqueIdRequest {
    /// Reserve `count` consecutive ids from the named sequence.
    Generate { name: String, count: u32 },
    /// Make sure the named sequence never hands out ids `<= floor`.
    Resync { name: String, floor: u64 },
}

/// Final decision for a staged transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueRequest {
    pub transaction_id: TransactionId,
    pub should_commit: bool,
}

/// Top-level response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Data(DataResponse),
    Exception(ExceptionResponse),
    Null,
    Ready { transaction_id: TransactionId },
}

impl Response {
    /// Whether this response ends a logical answer.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Data(_))
    }
}

/// Payload of a `Data` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataResponse {
    Objects(Vec<(ObjectKey, Bytes)>),
    Ids(Vec<u64>),
    Report(NodeReport),
}

/// Per-node housekeeping summary returned by `Analyze` and `Compact`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub live_objects: u64,
    pub valid_blocks: u64,
    pub invalid_blocks: u64,
    pub dirty_blocks: u64,
    pub deleted_blocks: u64,
    pub storage_bytes: u64,
    pub pending_transactions: u64,
}

/// Error crossing the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionResponse {
    /// Stable error code (see [`Error::error_code`]).
    pub kind: String,
    /// Rendered error, for display.
    pub message: String,
    /// The key, collection name, reason or message the error carries.
    pub subject: Option<String>,
    pub transaction_id: Option<u64>,
    pub waited_ms: Option<u64>,
    /// Server-side context, outermost first.
    pub context: Vec<String>,
    pub recoverable: bool,
}

impl ExceptionResponse {
    pub fn from_error(err: &Error, context: Vec<String>) -> Self {
        let (subject, transaction_id, waited_ms) = match err {
            Error::PreconditionFailed { key }
            | Error::KeyNotFound { key }
            | Error::DuplicateKey { key } => (Some(key.clone()), None, None),
            Error::LockTimeout { key, waited_ms } => (Some(key.clone()), None, Some(*waited_ms)),
            Error::SessionTimeout { message } | Error::Protocol { message } => {
                (Some(message.clone()), None, None)
            }
            Error::TransactionAborted {
                transaction_id,
                reason,
            } => (Some(reason.clone()), Some(*transaction_id), None),
            Error::InvalidTransition { transaction_id, .. } => (None, Some(*transaction_id), None),
            Error::UnknownCollection { name } => (Some(name.clone()), None, None),
            _ => (None, None, None),
        };
        Self {
            kind: err.error_code().to_string(),
            message: err.to_string(),
            subject,
            transaction_id,
            waited_ms,
            context,
            recoverable: err.is_recoverable(),
        }
    }

    /// Turn the exception back into a local error on the client.
    ///
    /// Keys and names come back untouched; free-text fields get the
    /// server context appended.
    pub fn into_error(self) -> Error {
        let context = if self.context.is_empty() {
            String::new()
        } else {
            format!(" [{}]", self.context.join(" <- "))
        };
        let exact = self.subject.clone().unwrap_or_else(|| self.message.clone());
        let text = format!("{}{}", exact, context);
        match self.kind.as_str() {
            "PRECONDITION_FAILED" => Error::PreconditionFailed { key: exact },
            "LOCK_TIMEOUT" => Error::LockTimeout {
                key: exact,
                waited_ms: self.waited_ms.unwrap_or(0),
            },
            "SESSION_TIMEOUT" => Error::SessionTimeout { message: text },
            "TRANSACTION_ABORTED" => Error::TransactionAborted {
                transaction_id: self.transaction_id.unwrap_or(0),
                reason: text,
            },
            "READ_ONLY" => Error::ReadOnly,
            "UNKNOWN_COLLECTION" => Error::UnknownCollection { name: exact },
            "KEY_NOT_FOUND" => Error::KeyNotFound { key: exact },
            "DUPLICATE_KEY" => Error::DuplicateKey { key: exact },
            "PROTOCOL_ERROR" => Error::Protocol { message: text },
            _ => Error::Protocol {
                message: format!("{}{}", self.message, context),
            },
        }
    }
}

/// Encode any protocol message to a MessagePack frame body.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(message)?)
}

/// Decode a MessagePack frame body.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}
