//! # Core Data Types
//!
//! Identifiers, resource keys and transaction operations shared across crates.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between collection name and primary key in a storage key.
pub const KEY_SEPARATOR: char = ':';

/// Globally unique transaction identifier, assigned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Session identifier, unique per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Index of a shard node within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Who owns a lock: a two-stage transaction or an interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockHolder {
    Transaction(TransactionId),
    Session(SessionId),
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Transaction(id) => id.fmt(f),
            LockHolder::Session(id) => id.fmt(f),
        }
    }
}

/// Validate a collection name.
///
/// Names must be non-empty ASCII alphanumerics, `_` or `-`, so that the
/// separator never appears inside them.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::Protocol {
            message: format!("invalid collection name: {:?}", name),
        })
    }
}

/// Address of one object: collection plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub collection: String,
    pub key: String,
}

impl ObjectKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// The primary key string stored inside a block.
    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.collection, KEY_SEPARATOR, self.key)
    }

    /// Inverse of [`ObjectKey::storage_key`].
    pub fn from_storage_key(raw: &str) -> Result<Self> {
        raw.split_once(KEY_SEPARATOR)
            .map(|(collection, key)| ObjectKey::new(collection, key))
            .ok_or_else(|| Error::Protocol {
                message: format!("malformed storage key: {:?}", raw),
            })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.collection, KEY_SEPARATOR, self.key)
    }
}

/// A lockable resource.
///
/// The derived ordering is the canonical global acquisition order: all
/// collection-level locks sort before object locks, then lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    /// Schema-level lock on a whole collection.
    Collection(String),
    /// A single object.
    Object(ObjectKey),
}

impl ResourceKey {
    pub fn object(collection: impl Into<String>, key: impl Into<String>) -> Self {
        ResourceKey::Object(ObjectKey::new(collection, key))
    }

    pub fn collection(name: impl Into<String>) -> Self {
        ResourceKey::Collection(name.into())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Collection(name) => write!(f, "{}{}*", name, KEY_SEPARATOR),
            ResourceKey::Object(key) => key.fmt(f),
        }
    }
}

/// One client-side operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert or replace.
    Put { key: ObjectKey, payload: Bytes },
    /// Replace only if the current payload equals `expected`.
    UpdateIf {
        key: ObjectKey,
        expected: Bytes,
        payload: Bytes,
    },
    /// Remove the object. Deleting a missing key is a no-op.
    Delete { key: ObjectKey },
}

impl Operation {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Operation::Put { key, .. } => key,
            Operation::UpdateIf { key, .. } => key,
            Operation::Delete { key } => key,
        }
    }

    pub fn resource(&self) -> ResourceKey {
        ResourceKey::Object(self.key().clone())
    }
}

/// A storage-level mutation staged in the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: String, payload: Bytes },
    Delete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }
}

impl From<&Operation> for Mutation {
    /// Preconditions are checked before staging, so `UpdateIf` becomes a plain put.
    fn from(op: &Operation) -> Self {
        match op {
            Operation::Put { key, payload } | Operation::UpdateIf { key, payload, .. } => {
                Mutation::Put {
                    key: key.storage_key(),
                    payload: payload.clone(),
                }
            }
            Operation::Delete { key } => Mutation::Delete {
                key: key.storage_key(),
            },
        }
    }
}
