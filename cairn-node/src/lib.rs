//! # Cairn Node
//!
//! Participant node and client plumbing for the Cairn cluster.
//!
//! ```text
//!  TransactionCoordinator ──► Channel ──┬── InProcessChannel ──┐
//!                                       └── TcpChannel ─► TcpServer
//!                                                              │
//!                                              run_session ◄───┘
//!                                                   │
//!                                              ShardNode ─► storage, log, locks
//!                                                   │
//!                                              Housekeeper
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let node = ShardNode::open(NodeContext::new(NodeId(0), config)).await?;
//! let channel: Arc<dyn Channel> = Arc::new(InProcessChannel::new(node));
//! let coordinator = TransactionCoordinator::new(vec![channel])?;
//! coordinator.declare_collection("accounts").await?;
//! coordinator.execute(vec![Operation::Put { key, payload }]).await?;
//! ```

pub mod channel;
pub mod context;
pub mod coordinator;
pub mod housekeeping;
pub mod node;
pub mod session;
pub mod tcp;

pub use channel::{Channel, InProcessChannel};
pub use context::NodeContext;
pub use coordinator::TransactionCoordinator;
pub use housekeeping::HousekeepingTask;
pub use node::ShardNode;
pub use tcp::{TcpChannel, TcpServer};
