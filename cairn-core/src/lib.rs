//! # Cairn Core
//!
//! This crate provides the fundamental building blocks for Cairn:
//! - Error types
//! - Configuration
//! - Keys, identifiers and transaction operations
//! - The request/response wire protocol
//! - Checksums, metrics and logging setup
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   cairn-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • types     - Keys, ids, operations            │
//! │  • protocol  - Request / Response enums         │
//! │  • error     - Error handling                   │
//! │  • config    - Node configuration               │
//! │  • checksum  - CRC32 integrity helpers          │
//! │  • metrics   - Atomic counters                  │
//! │  • logging   - tracing-subscriber setup         │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod checksum;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result, ResultExt};
pub use metrics::Metrics;
pub use protocol::{Request, Response};
pub use types::{
    LockHolder, Mutation, NodeId, ObjectKey, Operation, ResourceKey, SessionId, TransactionId,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;
