//! # Metrics
//!
//! Atomic counters shared by the storage engine, the log and the node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Storage metrics
    blocks_written: AtomicU64,
    bytes_written: AtomicU64,
    corrupt_blocks: AtomicU64,
    compactions: AtomicU64,
    bytes_reclaimed: AtomicU64,

    // Transaction metrics
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    lock_timeouts: AtomicU64,
    records_replayed: AtomicU64,
    records_discarded: AtomicU64,

    // Session metrics
    active_sessions: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an appended block
    pub fn record_block_write(&self, bytes: u64) {
        self.inner.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record invalid blocks found by a scan
    pub fn record_corruption(&self, count: u64) {
        self.inner.corrupt_blocks.fetch_add(count, Ordering::Relaxed);
    }

    /// Record compaction
    pub fn record_compaction(&self, reclaimed: u64) {
        self.inner.compactions.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.inner.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.inner.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.inner.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of log recovery
    pub fn record_recovery(&self, replayed: u64, discarded: u64) {
        self.inner.records_replayed.fetch_add(replayed, Ordering::Relaxed);
        self.inner.records_discarded.fetch_add(discarded, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.inner.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_written: self.inner.blocks_written.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            corrupt_blocks: self.inner.corrupt_blocks.load(Ordering::Relaxed),
            compactions: self.inner.compactions.load(Ordering::Relaxed),
            bytes_reclaimed: self.inner.bytes_reclaimed.load(Ordering::Relaxed),
            transactions_committed: self.inner.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.inner.transactions_rolled_back.load(Ordering::Relaxed),
            lock_timeouts: self.inner.lock_timeouts.load(Ordering::Relaxed),
            records_replayed: self.inner.records_replayed.load(Ordering::Relaxed),
            records_discarded: self.inner.records_discarded.load(Ordering::Relaxed),
            active_sessions: self.inner.active_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub corrupt_blocks: u64,
    pub compactions: u64,
    pub bytes_reclaimed: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub lock_timeouts: u64,
    pub records_replayed: u64,
    pub records_discarded: u64,
    pub active_sessions: u64,
}
