//! Key → node routing.

use std::collections::BTreeMap;

use cairn_core::{error::{Error, Result}, ObjectKey, Operation};

/// Places each object on `crc32(storage key) % node_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRouter {
    node_count: usize,
}

impl KeyRouter {
    pub fn new(node_count: usize) -> Result<Self> {
        if node_count == 0 {
            return Err(Error::Configuration {
                message: "a cluster needs at least one node".to_string(),
            });
        }
        Ok(Self { node_count })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    #[inline]
    pub fn route(&self, key: &ObjectKey) -> usize {
        crc32fast::hash(key.storage_key().as_bytes()) as usize % self.node_count
    }

    /// Group operations by node, keeping their relative order.
    pub fn partition(&self, operations: &[Operation]) -> BTreeMap<usize, Vec<Operation>> {
        let mut pieces: BTreeMap<usize, Vec<Operation>> = BTreeMap::new();
        for op in operations {
            pieces.entry(self.route(op.key())).or_default().push(op.clone());
        }
        pieces
    }

    /// Group keys by node.
    pub fn partition_keys(&self, keys: &[ObjectKey]) -> BTreeMap<usize, Vec<ObjectKey>> {
        let mut pieces: BTreeMap<usize, Vec<ObjectKey>> = BTreeMap::new();
        for key in keys {
            pieces.entry(self.route(key)).or_default().push(key.clone());
        }
        pieces
    }
}
