// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

/// A radix tree over declared address prefixes recording which transactions
/// read and write where.
///
/// Two declarations conflict when one is a prefix of the other (one subtree
/// contains the other), so an overlap query collects entries on the path
/// from the root to the queried node and in the entire subtree below it.
/// Edges are path bytes; prefixes are even-length hex strings.
#[derive(Default)]
pub struct PredecessorTree {
    root: TreeNode,
}

#[derive(Default)]
struct TreeNode {
    children: BTreeMap<u8, TreeNode>,
    readers: Vec<String>,
    writers: Vec<String>,
}

impl TreeNode {
    fn collect_subtree(&self, writers: bool, out: &mut Vec<String>) {
        let entries = if writers { &self.writers } else { &self.readers };
        out.extend(entries.iter().cloned());
        for child in self.children.values() {
            child.collect_subtree(writers, out);
        }
    }
}

fn prefix_bytes(prefix: &str) -> Vec<u8> {
    hex::decode(prefix).expect("declared prefixes are validated hex")
}

impl PredecessorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reader(&mut self, prefix: &str, txn_id: &str) {
        self.node_mut(&prefix_bytes(prefix))
            .readers
            .push(txn_id.to_string());
    }

    pub fn add_writer(&mut self, prefix: &str, txn_id: &str) {
        self.node_mut(&prefix_bytes(prefix))
            .writers
            .push(txn_id.to_string());
    }

    fn node_mut(&mut self, path: &[u8]) -> &mut TreeNode {
        let mut node = &mut self.root;
        for byte in path {
            node = node.children.entry(*byte).or_default();
        }
        node
    }

    /// Every writer whose declaration overlaps `prefix`, in recording
    /// order along the path and then subtree order.
    pub fn find_overlapping_writers(&self, prefix: &str) -> Vec<String> {
        self.find_overlapping(prefix, true)
    }

    /// Every reader whose declaration overlaps `prefix`.
    pub fn find_overlapping_readers(&self, prefix: &str) -> Vec<String> {
        self.find_overlapping(prefix, false)
    }

    fn find_overlapping(&self, prefix: &str, writers: bool) -> Vec<String> {
        let mut out = Vec::new();
        let mut node = &self.root;
        for byte in prefix_bytes(prefix) {
            let entries = if writers { &node.writers } else { &node.readers };
            out.extend(entries.iter().cloned());
            match node.children.get(&byte) {
                Some(child) => node = child,
                None => return out,
            }
        }
        node.collect_subtree(writers, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_and_descendant_declarations_overlap() {
        let mut tree = PredecessorTree::new();
        tree.add_writer("1cf126", "t1");
        tree.add_writer("1cf126aabb", "t2");
        tree.add_writer("2f0000", "t3");

        // Querying a descendant sees the ancestor writer.
        assert_eq!(tree.find_overlapping_writers("1cf126aabbcc"), vec!["t1", "t2"]);
        // Querying an ancestor sees the whole subtree.
        assert_eq!(tree.find_overlapping_writers("1cf126"), vec!["t1", "t2"]);
        // The empty prefix overlaps everything.
        assert_eq!(
            tree.find_overlapping_writers(""),
            vec!["t1", "t2", "t3"]
        );
        // Disjoint prefixes do not overlap.
        assert!(tree.find_overlapping_writers("3a0000").is_empty());
    }

    #[test]
    fn readers_and_writers_are_tracked_separately() {
        let mut tree = PredecessorTree::new();
        tree.add_reader("1cf126", "r1");
        tree.add_writer("1cf126", "w1");
        assert_eq!(tree.find_overlapping_readers("1cf126"), vec!["r1"]);
        assert_eq!(tree.find_overlapping_writers("1cf126"), vec!["w1"]);
    }

    #[test]
    fn root_declaration_conflicts_with_all() {
        let mut tree = PredecessorTree::new();
        tree.add_writer("", "broad");
        assert_eq!(tree.find_overlapping_writers("aabbcc"), vec!["broad"]);
    }
}
