//! # Cairn Transactions
//!
//! Concurrency control for two-stage transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Transaction Layer                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │    Lock     │    │  In-Flight  │    │    Key      │      │
//! │  │   Manager   │    │   Table     │    │   Router    │      │
//! │  │ (per node)  │    │(coordinator)│    │  (CRC32)    │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `lock_manager`: ordered exclusive locks with timeout
//! - `transaction`: coordinator state machine
//! - `table`: id-indexed transactions in flight
//! - `router`: key placement across nodes

pub mod lock_manager;
pub mod router;
pub mod table;
pub mod transaction;

pub use lock_manager::LockManager;
pub use router::KeyRouter;
pub use table::InFlightTable;
pub use transaction::{Transaction, TransactionState};
