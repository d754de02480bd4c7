//! In-flight transaction table, indexed by transaction id.

use std::collections::HashMap;

use parking_lot::Mutex;

use cairn_core::{
    error::{Error, Result},
    NodeId, Operation, TransactionId,
};

use crate::transaction::{Transaction, TransactionState};

#[derive(Default)]
pub struct InFlightTable {
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: TransactionId, operations: &[Operation]) -> Result<()> {
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&id) {
            return Err(Error::Internal {
                message: format!("{} is already in flight", id),
            });
        }
        transactions.insert(id, Transaction::new(id, operations));
        Ok(())
    }

    fn with<T>(&self, id: TransactionId, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut transactions = self.transactions.lock();
        let txn = transactions.get_mut(&id).ok_or_else(|| Error::Internal {
            message: format!("{} is not in flight", id),
        })?;
        f(txn)
    }

    pub fn set_participants(&self, id: TransactionId, participants: Vec<NodeId>) -> Result<()> {
        self.with(id, |txn| {
            txn.set_participants(participants);
            Ok(())
        })
    }

    pub fn transition(&self, id: TransactionId, next: TransactionState) -> Result<()> {
        self.with(id, |txn| txn.transition(next))
    }

    pub fn fail(&self, id: TransactionId, reason: impl Into<String>) -> Result<()> {
        self.with(id, |txn| txn.fail(reason))
    }

    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        self.transactions.lock().get(&id).map(|t| t.state())
    }

    pub fn get(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions.lock().get(&id).cloned()
    }

    /// Drop a transaction that reached a terminal state.
    pub fn finish(&self, id: TransactionId) -> Option<Transaction> {
        let mut transactions = self.transactions.lock();
        match transactions.get(&id) {
            Some(txn) if txn.state().is_terminal() => transactions.remove(&id),
            _ => None,
        }
    }

    /// Transactions not yet committed or rolled back, oldest id first.
    pub fn unresolved(&self) -> Vec<(TransactionId, TransactionState)> {
        let mut pending: Vec<_> = self
            .transactions
            .lock()
            .values()
            .filter(|t| !t.state().is_terminal())
            .map(|t| (t.id(), t.state()))
            .collect();
        pending.sort_by_key(|(id, _)| *id);
        pending
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
