//! # Cairn Storage Engine
//!
//! Append-only block storage with in-place status flips, plus the
//! transaction log used by two-stage commits.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  Commit ──> TransactionLog ──> ReliableStorage              │
//! │             (ToProcess,          append block,              │
//! │              Processing)         flip old to Dirty          │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  get(key) ──> index (key → offset) ──> read + verify block  │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Maintenance                            │
//! │                                                             │
//! │  compact_and_repair: live blocks ──> temp file ──> rename   │
//! │  analyze:            scan report of any storage file        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod compaction;
pub mod scan;
pub mod storage;
pub mod txlog;

pub use block::{BlockStatus, PersistentBlock};
pub use compaction::{compact_and_repair, CompactionReport};
pub use scan::{analyze, ScanReport, ScannedBlock};
pub use storage::{BlockLocation, ReliableStorage};
pub use txlog::{LogRecord, LogStatus, RecoveryPlan, TransactionLog};
