// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    node::{node_hash, Node},
    store::MerkleNodeStore,
    MerkleError,
};
use once_cell::sync::Lazy;
use sawtooth_types::Address;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

static EMPTY_ROOT: Lazy<String> = Lazy::new(|| {
    let bytes = Node::default()
        .to_bytes()
        .expect("empty node serializes");
    node_hash(&bytes)
});

/// The canonical root of an empty tree.
pub fn empty_tree_root() -> &'static str {
    &EMPTY_ROOT
}

/// A read handle on one version of the state tree, identified by its root.
/// `update` does not mutate the handle; it writes a new version and returns
/// the new root.
pub struct MerkleRadixTree {
    store: Arc<dyn MerkleNodeStore>,
    root: String,
}

impl MerkleRadixTree {
    /// Opens the tree at `root`, or at a freshly-written empty root when
    /// `root` is `None`.
    pub fn new(
        store: Arc<dyn MerkleNodeStore>,
        root: Option<&str>,
    ) -> Result<Self, MerkleError> {
        let root = match root {
            Some(root) => {
                if store.get_node(root)?.is_none() {
                    return Err(MerkleError::MissingNode {
                        hash: root.to_string(),
                    });
                }
                root.to_string()
            }
            None => {
                let bytes = Node::default().to_bytes()?;
                let hash = node_hash(&bytes);
                store.put_nodes(&[(hash.clone(), bytes)])?;
                hash
            }
        };
        Ok(Self { store, root })
    }

    pub fn root_hash(&self) -> &str {
        &self.root
    }

    fn read_node(&self, hash: &str) -> Result<Node, MerkleError> {
        let bytes = self
            .store
            .get_node(hash)?
            .ok_or_else(|| MerkleError::MissingNode {
                hash: hash.to_string(),
            })?;
        Node::from_bytes(&bytes)
    }

    /// Reads the value at a full address, or `None` when the path is not
    /// populated in this version.
    pub fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, MerkleError> {
        let mut node = self.read_node(&self.root)?;
        for byte in address.path_bytes() {
            match node.children.get(&byte) {
                Some(child_hash) => node = self.read_node(child_hash)?,
                None => return Ok(None),
            }
        }
        Ok(node.value)
    }

    /// Loads every node along `path` into `cache`, creating empty nodes for
    /// absent links when `create` is set. Returns whether the full path is
    /// present in the cache afterwards.
    fn load_path(
        &self,
        cache: &mut HashMap<Vec<u8>, Node>,
        path: &[u8],
        create: bool,
    ) -> Result<bool, MerkleError> {
        for depth in 1..=path.len() {
            let prefix = path[..depth].to_vec();
            if cache.contains_key(&prefix) {
                continue;
            }
            let parent = &path[..depth - 1];
            let edge = path[depth - 1];
            let child_hash = cache
                .get(parent)
                .expect("parent prefix loaded first")
                .children
                .get(&edge)
                .cloned();
            match child_hash {
                Some(hash) => {
                    let node = self.read_node(&hash)?;
                    cache.insert(prefix, node);
                }
                None if create => {
                    cache.insert(prefix, Node::default());
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Applies a batch of sets and deletes, returning the root of the new
    /// version. Untouched subtrees are shared with the current version; no
    /// existing node is modified or removed.
    pub fn update(
        &self,
        sets: &[(Address, Vec<u8>)],
        deletes: &[Address],
    ) -> Result<String, MerkleError> {
        let mut cache: HashMap<Vec<u8>, Node> = HashMap::new();
        cache.insert(Vec::new(), self.read_node(&self.root)?);

        for (address, value) in sets {
            let path = address.path_bytes();
            self.load_path(&mut cache, &path, true)?;
            cache
                .get_mut(&path)
                .expect("path loaded")
                .value = Some(value.clone());
        }
        for address in deletes {
            let path = address.path_bytes();
            if self.load_path(&mut cache, &path, false)? {
                cache.get_mut(&path).expect("path loaded").value = None;
            }
        }

        // Re-hash bottom-up: children strictly before parents.
        let mut paths: Vec<Vec<u8>> = cache.keys().filter(|p| !p.is_empty()).cloned().collect();
        paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut new_nodes: Vec<(String, Vec<u8>)> = Vec::new();
        for path in paths {
            let node = cache.remove(&path).expect("still cached");
            let edge = *path.last().expect("non-root path");
            let parent = cache
                .get_mut(&path[..path.len() - 1])
                .expect("parent cached");
            if node.is_empty() {
                parent.children.remove(&edge);
            } else {
                let bytes = node.to_bytes()?;
                let hash = node_hash(&bytes);
                parent.children.insert(edge, hash.clone());
                new_nodes.push((hash, bytes));
            }
        }

        let root_node = cache.remove(&Vec::new()).expect("root cached");
        let bytes = root_node.to_bytes()?;
        let new_root = node_hash(&bytes);
        new_nodes.push((new_root.clone(), bytes));

        self.store.put_nodes(&new_nodes)?;
        Ok(new_root)
    }

    /// All populated addresses under an even-length hex prefix, in address
    /// order.
    pub fn leaves(&self, prefix: &str) -> Result<Vec<(Address, Vec<u8>)>, MerkleError> {
        if prefix.len() % 2 != 0 {
            return Err(MerkleError::InvalidPath(prefix.to_string()));
        }
        let prefix_bytes =
            hex::decode(prefix).map_err(|_| MerkleError::InvalidPath(prefix.to_string()))?;

        let mut node = self.read_node(&self.root)?;
        for byte in &prefix_bytes {
            match node.children.get(byte) {
                Some(child_hash) => node = self.read_node(child_hash)?,
                None => return Ok(Vec::new()),
            }
        }

        let mut out = Vec::new();
        self.collect_leaves(&prefix_bytes, &node, &mut out)?;
        Ok(out)
    }

    fn collect_leaves(
        &self,
        path: &[u8],
        node: &Node,
        out: &mut Vec<(Address, Vec<u8>)>,
    ) -> Result<(), MerkleError> {
        if let Some(value) = &node.value {
            let address = Address::new(hex::encode(path))
                .map_err(|e| MerkleError::InvalidPath(e.to_string()))?;
            out.push((address, value.clone()));
        }
        for (edge, child_hash) in &node.children {
            let child = self.read_node(child_hash)?;
            let mut child_path = path.to_vec();
            child_path.push(*edge);
            self.collect_leaves(&child_path, &child, out)?;
        }
        Ok(())
    }
}

/// Deletes every node not reachable from `live_roots`. Returns the number of
/// nodes removed. A missing node under a live root is corruption.
pub fn prune(
    store: &dyn MerkleNodeStore,
    live_roots: &[String],
) -> Result<usize, MerkleError> {
    let mut reachable: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = live_roots.to_vec();
    while let Some(hash) = stack.pop() {
        if !reachable.insert(hash.clone()) {
            continue;
        }
        let bytes = store
            .get_node(&hash)?
            .ok_or(MerkleError::MissingNode { hash })?;
        let node = Node::from_bytes(&bytes)?;
        stack.extend(node.children.into_values());
    }

    let dead: Vec<String> = store
        .node_hashes()?
        .into_iter()
        .filter(|hash| !reachable.contains(hash))
        .collect();
    store.delete_nodes(&dead)?;
    Ok(dead.len())
}
