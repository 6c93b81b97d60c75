// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    context::{Context, ContextId},
    StateError,
};
use parking_lot::RwLock;
use rand::RngCore;
use sawtooth_merkle::{InMemoryNodeStore, MerkleNodeStore, MerkleRadixTree};
use sawtooth_types::{Address, Event, StateChange};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::debug;

/// Creates, serves and squashes execution contexts over a shared merkle node
/// store. Contexts are owned by exactly one in-flight transaction; the
/// manager only brokers access.
pub struct ContextManager {
    store: Arc<dyn MerkleNodeStore>,
    contexts: RwLock<HashMap<ContextId, Context>>,
}

impl ContextManager {
    pub fn new(store: Arc<dyn MerkleNodeStore>) -> Self {
        Self {
            store,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_store(&self) -> Arc<dyn MerkleNodeStore> {
        self.store.clone()
    }

    /// Opens a context over `state_root`, reading through `base_contexts`
    /// (most recent last) before falling back to state.
    pub fn create_context(
        &self,
        state_root: &str,
        base_contexts: Vec<ContextId>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> ContextId {
        let mut id_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut id_bytes);
        let context_id = hex::encode(id_bytes);
        let context = Context::new(state_root.to_string(), base_contexts, inputs, outputs);
        self.contexts.write().insert(context_id.clone(), context);
        context_id
    }

    /// Reads through the overlay chain: own writes, then parent contexts
    /// most-recent-first (transitively), then the base state root.
    pub fn get(
        &self,
        context_id: &ContextId,
        addresses: &[Address],
    ) -> Result<Vec<Option<Vec<u8>>>, StateError> {
        let contexts = self.contexts.read();
        let context = contexts
            .get(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;

        let mut results = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !context.is_readable(address) {
                return Err(StateError::Authorization {
                    op: "read",
                    address: address.to_string(),
                });
            }
            match Self::overlay_lookup(&contexts, context, address) {
                Some(found) => results.push(found),
                None => {
                    let tree =
                        MerkleRadixTree::new(self.store.clone(), Some(&context.state_root))?;
                    results.push(tree.get(address)?);
                }
            }
        }
        Ok(results)
    }

    /// Depth-first search of the overlay chain. Returns `Some(value)` /
    /// `Some(None)` (tombstone) when any context on the chain wrote the
    /// address, `None` when state must be consulted.
    fn overlay_lookup(
        contexts: &HashMap<ContextId, Context>,
        context: &Context,
        address: &Address,
    ) -> Option<Option<Vec<u8>>> {
        if let Some(entry) = context.written(address) {
            return Some(entry.clone());
        }
        for parent_id in context.base_contexts.iter().rev() {
            if let Some(parent) = contexts.get(parent_id) {
                if let Some(found) = Self::overlay_lookup(contexts, parent, address) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn set(
        &self,
        context_id: &ContextId,
        entries: Vec<(Address, Vec<u8>)>,
    ) -> Result<(), StateError> {
        let mut contexts = self.contexts.write();
        let context = contexts
            .get_mut(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;
        for (address, _) in &entries {
            if !context.is_writable(address) {
                return Err(StateError::Authorization {
                    op: "write",
                    address: address.to_string(),
                });
            }
        }
        for (address, value) in entries {
            context.put(address, Some(value));
        }
        Ok(())
    }

    pub fn delete(
        &self,
        context_id: &ContextId,
        addresses: &[Address],
    ) -> Result<(), StateError> {
        let mut contexts = self.contexts.write();
        let context = contexts
            .get_mut(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;
        for address in addresses {
            if !context.is_writable(address) {
                return Err(StateError::Authorization {
                    op: "delete",
                    address: address.to_string(),
                });
            }
        }
        for address in addresses {
            context.put(address.clone(), None);
        }
        Ok(())
    }

    pub fn add_event(&self, context_id: &ContextId, event: Event) -> Result<(), StateError> {
        let mut contexts = self.contexts.write();
        contexts
            .get_mut(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?
            .add_event(event);
        Ok(())
    }

    pub fn add_receipt_data(
        &self,
        context_id: &ContextId,
        data: Vec<u8>,
    ) -> Result<(), StateError> {
        let mut contexts = self.contexts.write();
        contexts
            .get_mut(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?
            .add_data(data);
        Ok(())
    }

    /// Everything the receipt pipeline needs from a finished context.
    pub fn execution_results(
        &self,
        context_id: &ContextId,
    ) -> Result<(Vec<StateChange>, Vec<Event>, Vec<Vec<u8>>), StateError> {
        let contexts = self.contexts.read();
        let context = contexts
            .get(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;
        Ok((
            context.state_changes(),
            context.events().to_vec(),
            context.data().to_vec(),
        ))
    }

    /// Collapses `context_ids` (in order; later contexts win) into a single
    /// merkle update over `state_root`. With `persist` unset the new nodes
    /// go to a scratch overlay and only the root hash escapes.
    pub fn squash(
        &self,
        state_root: &str,
        context_ids: &[ContextId],
        persist: bool,
    ) -> Result<String, StateError> {
        let mut folded: BTreeMap<Address, Option<Vec<u8>>> = BTreeMap::new();
        {
            let contexts = self.contexts.read();
            for context_id in context_ids {
                let context = contexts
                    .get(context_id)
                    .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;
                for change in context.state_changes() {
                    match change {
                        StateChange::Set { address, value } => {
                            folded.insert(address, Some(value));
                        }
                        StateChange::Delete { address } => {
                            folded.insert(address, None);
                        }
                    }
                }
            }
        }

        let mut sets = Vec::new();
        let mut deletes = Vec::new();
        for (address, value) in folded {
            match value {
                Some(value) => sets.push((address, value)),
                None => deletes.push(address),
            }
        }

        let store: Arc<dyn MerkleNodeStore> = if persist {
            self.store.clone()
        } else {
            Arc::new(ScratchNodeStore {
                base: self.store.clone(),
                scratch: InMemoryNodeStore::new(),
            })
        };
        let tree = MerkleRadixTree::new(store, Some(state_root))?;
        let new_root = tree.update(&sets, &deletes)?;
        debug!(
            contexts = context_ids.len(),
            persist, %new_root, "squashed contexts"
        );
        Ok(new_root)
    }

    /// Drops finished contexts. Unknown ids are ignored; cancellation and
    /// cleanup paths race benignly here.
    pub fn delete_contexts(&self, context_ids: &[ContextId]) {
        let mut contexts = self.contexts.write();
        for context_id in context_ids {
            contexts.remove(context_id);
        }
    }
}

/// Read-through store that keeps new nodes out of the backing store; used
/// for speculative squashes (candidate blocks that may never commit).
struct ScratchNodeStore {
    base: Arc<dyn MerkleNodeStore>,
    scratch: InMemoryNodeStore,
}

impl MerkleNodeStore for ScratchNodeStore {
    fn get_node(&self, hash: &str) -> Result<Option<Vec<u8>>, sawtooth_merkle::MerkleError> {
        if let Some(found) = self.scratch.get_node(hash)? {
            return Ok(Some(found));
        }
        self.base.get_node(hash)
    }

    fn put_nodes(
        &self,
        nodes: &[(String, Vec<u8>)],
    ) -> Result<(), sawtooth_merkle::MerkleError> {
        self.scratch.put_nodes(nodes)
    }

    fn delete_nodes(&self, hashes: &[String]) -> Result<(), sawtooth_merkle::MerkleError> {
        self.scratch.delete_nodes(hashes)
    }

    fn node_hashes(&self) -> Result<Vec<String>, sawtooth_merkle::MerkleError> {
        let mut hashes = self.base.node_hashes()?;
        hashes.extend(self.scratch.node_hashes()?);
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_ok, assert_some_eq};
    use sawtooth_merkle::empty_tree_root;
    use sawtooth_types::EventAttribute;

    fn addr(seed: u8) -> Address {
        Address::new(format!("{:02x}", seed).repeat(35)).unwrap()
    }

    fn manager_over_empty() -> (ContextManager, String) {
        let store: Arc<dyn MerkleNodeStore> = Arc::new(InMemoryNodeStore::new());
        let tree = MerkleRadixTree::new(store.clone(), None).unwrap();
        let root = tree.root_hash().to_string();
        (ContextManager::new(store), root)
    }

    #[test]
    fn writes_are_visible_to_own_reads() {
        let (manager, root) = manager_over_empty();
        let ctx = manager.create_context(&root, vec![], vec!["".into()], vec!["".into()]);
        manager.set(&ctx, vec![(addr(1), vec![10])]).unwrap();
        let values = manager.get(&ctx, &[addr(1), addr(2)]).unwrap();
        assert_some_eq!(values[0].clone(), vec![10]);
        assert_none!(values[1].clone());
    }

    #[test]
    fn reads_require_declared_inputs_and_writes_declared_outputs() {
        let (manager, root) = manager_over_empty();
        let ns = addr(1).namespace().to_string();
        let ctx = manager.create_context(&root, vec![], vec![ns.clone()], vec![ns]);

        assert_ok!(manager.get(&ctx, &[addr(1)]));
        assert!(matches!(
            manager.get(&ctx, &[addr(2)]),
            Err(StateError::Authorization { op: "read", .. })
        ));
        assert_ok!(manager.set(&ctx, vec![(addr(1), vec![1])]));
        assert!(matches!(
            manager.set(&ctx, vec![(addr(2), vec![2])]),
            Err(StateError::Authorization { op: "write", .. })
        ));
        assert!(matches!(
            manager.delete(&ctx, &[addr(2)]),
            Err(StateError::Authorization { op: "delete", .. })
        ));
    }

    #[test]
    fn parent_chain_reads_most_recent_first() {
        let (manager, root) = manager_over_empty();
        let everything = vec!["".to_string()];
        let older = manager.create_context(&root, vec![], everything.clone(), everything.clone());
        manager.set(&older, vec![(addr(5), vec![1])]).unwrap();
        let newer = manager.create_context(&root, vec![], everything.clone(), everything.clone());
        manager.set(&newer, vec![(addr(5), vec![2])]).unwrap();

        let child = manager.create_context(
            &root,
            vec![older.clone(), newer.clone()],
            everything.clone(),
            everything,
        );
        let values = manager.get(&child, &[addr(5)]).unwrap();
        assert_some_eq!(values[0].clone(), vec![2]);
    }

    #[test]
    fn tombstones_shadow_base_state() {
        let store: Arc<dyn MerkleNodeStore> = Arc::new(InMemoryNodeStore::new());
        let tree = MerkleRadixTree::new(store.clone(), None).unwrap();
        let root = tree.update(&[(addr(7), vec![7])], &[]).unwrap();
        let manager = ContextManager::new(store);

        let everything = vec!["".to_string()];
        let ctx = manager.create_context(&root, vec![], everything.clone(), everything);
        assert_some_eq!(manager.get(&ctx, &[addr(7)]).unwrap()[0].clone(), vec![7]);
        manager.delete(&ctx, &[addr(7)]).unwrap();
        assert_none!(manager.get(&ctx, &[addr(7)]).unwrap()[0].clone());
    }

    #[test]
    fn squash_applies_contexts_in_order() {
        let (manager, root) = manager_over_empty();
        let everything = vec!["".to_string()];
        let first = manager.create_context(&root, vec![], everything.clone(), everything.clone());
        manager.set(&first, vec![(addr(1), vec![1])]).unwrap();
        let second = manager.create_context(&root, vec![], everything.clone(), everything);
        manager.set(&second, vec![(addr(1), vec![2])]).unwrap();

        let new_root = manager
            .squash(&root, &[first, second], true)
            .unwrap();
        let tree = MerkleRadixTree::new(manager.node_store(), Some(&new_root)).unwrap();
        assert_some_eq!(tree.get(&addr(1)).unwrap(), vec![2]);
    }

    #[test]
    fn unpersisted_squash_leaves_no_nodes_behind() {
        let (manager, root) = manager_over_empty();
        let everything = vec!["".to_string()];
        let ctx = manager.create_context(&root, vec![], everything.clone(), everything);
        manager.set(&ctx, vec![(addr(3), vec![3])]).unwrap();

        let virtual_root = manager.squash(&root, &[ctx.clone()], false).unwrap();
        assert_ne!(virtual_root, empty_tree_root());
        // The computed root is not in the backing store.
        assert!(MerkleRadixTree::new(manager.node_store(), Some(&virtual_root)).is_err());

        // Persisting the same contexts lands on the same root, now backed.
        let persisted_root = manager.squash(&root, &[ctx], true).unwrap();
        assert_eq!(persisted_root, virtual_root);
        assert_ok!(MerkleRadixTree::new(
            manager.node_store(),
            Some(&persisted_root)
        ));
    }

    #[test]
    fn execution_results_report_changes_events_and_data() {
        let (manager, root) = manager_over_empty();
        let everything = vec!["".to_string()];
        let ctx = manager.create_context(&root, vec![], everything.clone(), everything);
        manager.set(&ctx, vec![(addr(1), vec![1])]).unwrap();
        manager.delete(&ctx, &[addr(2)]).unwrap();
        manager
            .add_event(
                &ctx,
                Event::new("demo", vec![EventAttribute::new("k", "v")], vec![]),
            )
            .unwrap();
        manager.add_receipt_data(&ctx, b"opaque".to_vec()).unwrap();

        let (changes, events, data) = manager.execution_results(&ctx).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], StateChange::Set { .. }));
        assert!(matches!(changes[1], StateChange::Delete { .. }));
        assert_eq!(events.len(), 1);
        assert_eq!(data, vec![b"opaque".to_vec()]);

        manager.delete_contexts(&[ctx.clone()]);
        assert!(manager.execution_results(&ctx).is_err());
    }
}
