//! Transaction types and state management.

use std::fmt;
use std::time::Instant;

use cairn_core::{
    error::{Error, Result},
    NodeId, Operation, TransactionId,
};

/// Coordinator-side lifecycle of a two-stage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Created,
    /// Every participant has been sent its piece.
    Staged,
    /// Every participant answered Ready.
    ReadyToCommit,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }

    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Created, Staged)
                | (Created, RolledBack)
                | (Staged, ReadyToCommit)
                | (Staged, RolledBack)
                | (ReadyToCommit, Committed)
                | (ReadyToCommit, RolledBack)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A transaction tracked by the coordinator.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) state: TransactionState,
    pub(crate) participants: Vec<NodeId>,
    pub(crate) operation_count: usize,
    /// Why the transaction rolled back, if it did.
    pub(crate) failure: Option<String>,
    pub(crate) created_at: Instant,
}

impl Transaction {
    pub fn new(id: TransactionId, operations: &[Operation]) -> Self {
        Self {
            id,
            state: TransactionState::Created,
            participants: Vec::new(),
            operation_count: operations.len(),
            failure: None,
            created_at: Instant::now(),
        }
    }

    #[inline]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn participants(&self) -> &[NodeId] {
        &self.participants
    }

    pub fn operation_count(&self) -> usize {
        self.operation_count
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn set_participants(&mut self, mut participants: Vec<NodeId>) {
        participants.sort();
        participants.dedup();
        self.participants = participants;
    }

    /// Move to `next`, rejecting transitions the protocol does not allow.
    pub fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                transaction_id: self.id.0,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Roll back from any non-terminal state, keeping the first reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TransactionState::RolledBack)?;
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
        Ok(())
    }
}
