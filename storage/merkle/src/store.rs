// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::MerkleError;
use sawtooth_infallible::RwLock;
use std::collections::HashMap;

/// Backing storage for serialized merkle nodes, keyed by node hash.
///
/// Implementations must be safe for concurrent readers; the tree only ever
/// inserts new keys (content-addressed, so a re-insert is idempotent) and
/// deletes during pruning.
pub trait MerkleNodeStore: Send + Sync {
    fn get_node(&self, hash: &str) -> Result<Option<Vec<u8>>, MerkleError>;

    /// Writes a set of nodes. The write need not be atomic across nodes;
    /// partially-written updates are invisible because nothing references
    /// the new root until the caller publishes it.
    fn put_nodes(&self, nodes: &[(String, Vec<u8>)]) -> Result<(), MerkleError>;

    fn delete_nodes(&self, hashes: &[String]) -> Result<(), MerkleError>;

    /// Every stored node hash; used by mark-and-sweep pruning.
    fn node_hashes(&self) -> Result<Vec<String>, MerkleError>;
}

/// Heap-backed node store used by tests and by schedulers computing
/// speculative roots that are never persisted.
#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl MerkleNodeStore for InMemoryNodeStore {
    fn get_node(&self, hash: &str) -> Result<Option<Vec<u8>>, MerkleError> {
        Ok(self.nodes.read().get(hash).cloned())
    }

    fn put_nodes(&self, nodes: &[(String, Vec<u8>)]) -> Result<(), MerkleError> {
        let mut guard = self.nodes.write();
        for (hash, bytes) in nodes {
            guard.insert(hash.clone(), bytes.clone());
        }
        Ok(())
    }

    fn delete_nodes(&self, hashes: &[String]) -> Result<(), MerkleError> {
        let mut guard = self.nodes.write();
        for hash in hashes {
            guard.remove(hash);
        }
        Ok(())
    }

    fn node_hashes(&self) -> Result<Vec<String>, MerkleError> {
        Ok(self.nodes.read().keys().cloned().collect())
    }
}
