// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! The Merkle-Radix global state tree.
//!
//! State is a radix tree over the 35 bytes of an address, one byte per edge.
//! A node is `(children: BTreeMap<edge, child hash>, value)`; its key is the
//! first 64 hex characters of the SHA-512 digest of its canonical (bcs)
//! serialization. A version of the whole tree is identified by its root key,
//! and updates are copy-on-write: a new root shares every untouched subtree
//! with its predecessors.

mod node;
mod store;
mod tree;

pub use node::{node_hash, Node};
pub use store::{InMemoryNodeStore, MerkleNodeStore};
pub use tree::{empty_tree_root, prune, MerkleRadixTree};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MerkleError {
    /// A node referenced along a live path is absent from the backing store.
    /// This means the store is corrupt; callers treat it as fatal.
    #[error("missing merkle node {hash}")]
    MissingNode { hash: String },
    #[error("invalid address or prefix: {0}")]
    InvalidPath(String),
    #[error("node serialization failed: {0}")]
    Serialization(String),
    #[error("node store error: {0}")]
    Store(String),
}
