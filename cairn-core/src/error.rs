//! # Error Handling
//!
//! Error types shared by every Cairn crate.
//!
//! ## Taxonomy
//!
//! 1. **Corruption**: damaged blocks or log records. Scanners count these
//!    instead of returning them; only point reads surface them.
//! 2. **Precondition**: an `UpdateIf` mismatch. Rolls back the whole transaction.
//! 3. **Lock timeout**: ordered acquisition did not finish before the deadline.
//! 4. **Session timeout**: the continue signal never arrived, treated as abort.
//! 5. **I/O**: fatal to the node, always propagated with its message.

use thiserror::Error;

/// Result type alias for Cairn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Cairn
#[derive(Error, Debug)]
pub enum Error {
    // Storage Errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Corrupted data at offset {offset}: {details}")]
    Corruption { offset: u64, details: String },

    #[error("Truncated record at offset {offset}")]
    TruncatedRecord { offset: u64 },

    #[error("Transaction log error: {message}")]
    TransactionLog { message: String },

    #[error("Compaction failed: {reason}")]
    Compaction { reason: String },

    // Transaction Errors
    #[error("Precondition failed for {key}")]
    PreconditionFailed { key: String },

    #[error("Lock timeout after {waited_ms}ms on {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("Session timeout: {message}")]
    SessionTimeout { message: String },

    #[error("Transaction {transaction_id} aborted: {reason}")]
    TransactionAborted { transaction_id: u64, reason: String },

    #[error("Invalid transition for transaction {transaction_id}: {from} -> {to}")]
    InvalidTransition {
        transaction_id: u64,
        from: String,
        to: String,
    },

    // Schema and protocol Errors
    #[error("Unknown collection: {name}")]
    UnknownCollection { name: String },

    #[error("Key already exists: {key}")]
    DuplicateKey { key: String },

    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Node is in read-only mode")]
    ReadOnly,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // System Errors
    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Check if error is recoverable
    ///
    /// Recoverable errors leave the node healthy; the client may retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::LockTimeout { .. } => true,
            Error::SessionTimeout { .. } => true,
            Error::PreconditionFailed { .. } => true,
            Error::TransactionAborted { .. } => true,
            Error::Io { .. } => false,
            Error::Corruption { .. } => false,
            Error::TruncatedRecord { .. } => false,
            Error::Internal { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Storage { .. } => "STORAGE_ERROR",
            Error::Corruption { .. } => "CORRUPTION",
            Error::TruncatedRecord { .. } => "TRUNCATED_RECORD",
            Error::TransactionLog { .. } => "TRANSACTION_LOG_ERROR",
            Error::Compaction { .. } => "COMPACTION_ERROR",
            Error::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            Error::LockTimeout { .. } => "LOCK_TIMEOUT",
            Error::SessionTimeout { .. } => "SESSION_TIMEOUT",
            Error::TransactionAborted { .. } => "TRANSACTION_ABORTED",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::UnknownCollection { .. } => "UNKNOWN_COLLECTION",
            Error::DuplicateKey { .. } => "DUPLICATE_KEY",
            Error::KeyNotFound { .. } => "KEY_NOT_FOUND",
            Error::ReadOnly => "READ_ONLY",
            Error::Protocol { .. } => "PROTOCOL_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            // I/O keeps its source so the original errno survives
            Error::Io { message, source } => Error::Io {
                message: format!("{}: {}", f(), message),
                source,
            },
            other => Error::Internal {
                message: format!("{}: {}", f(), other),
            },
        })
    }
}

impl<T> ResultExt<T> for std::io::Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Io {
            message: format!("{}: {}", f(), e),
            source: e,
        })
    }
}
