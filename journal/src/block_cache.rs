// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use lru::LruCache;
use parking_lot::Mutex;
use sawtooth_chain_store::ChainStore;
use sawtooth_consensus::ConsensusBlockReader;
use sawtooth_types::Block;
use std::sync::Arc;
use tracing::warn;

/// Validation status of a cached block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    Unknown,
    Valid,
    Invalid,
}

#[derive(Clone)]
struct CachedBlock {
    block: Block,
    previous: String,
    status: BlockStatus,
}

/// The in-memory working set of blocks the journal is currently reasoning
/// about. Lookups fall through to the block store (store hits are committed
/// and therefore `Valid`). A block stays cached while any other cached
/// block names it as predecessor.
pub struct BlockCache {
    store: Arc<ChainStore>,
    inner: Mutex<LruCache<String, CachedBlock>>,
    capacity: usize,
}

impl BlockCache {
    pub fn new(store: Arc<ChainStore>, capacity: usize) -> Self {
        let cache = Self {
            store,
            inner: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
        };
        cache.rebuild();
        cache
    }

    /// Seeds the cache with the tip of the committed chain.
    fn rebuild(&self) {
        let mut loaded = Vec::new();
        for block in self.store.chain_iter().take(self.capacity) {
            match block {
                Ok(block) => loaded.push(block),
                Err(err) => {
                    warn!(error = %err, "chain walk failed while rebuilding block cache");
                    break;
                }
            }
        }
        // Oldest first so the head ends up most recently used.
        for block in loaded.into_iter().rev() {
            self.put(block, BlockStatus::Valid);
        }
    }

    pub fn put(&self, block: Block, status: BlockStatus) {
        let previous = match block.header() {
            Ok(header) => header.previous_block_id,
            Err(err) => {
                warn!(block = %block.id(), error = %err, "refusing to cache unparseable block");
                return;
            }
        };
        let mut inner = self.inner.lock();
        inner.put(
            block.id().to_string(),
            CachedBlock {
                previous,
                block,
                status,
            },
        );
        Self::evict(&mut inner, self.capacity);
    }

    /// Removes least-recently-used entries over capacity, skipping blocks
    /// still referenced as a predecessor by any cached block.
    fn evict(inner: &mut LruCache<String, CachedBlock>, capacity: usize) {
        while inner.len() > capacity {
            let referenced: std::collections::HashSet<String> = inner
                .iter()
                .map(|(_, cached)| cached.previous.clone())
                .collect();
            let newest = inner.iter().next().map(|(id, _)| id.clone());
            // `iter` walks most- to least-recently used; never evict the
            // entry that was just touched.
            let victim = inner
                .iter()
                .rev()
                .find(|(id, _)| !referenced.contains(*id) && Some(*id) != newest.as_ref())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    inner.pop(&id);
                }
                // Every entry is someone's predecessor; let the cache run
                // over capacity rather than break the chain structure.
                None => break,
            }
        }
    }

    pub fn get(&self, block_id: &str) -> Option<Block> {
        {
            let mut inner = self.inner.lock();
            if let Some(cached) = inner.get(block_id) {
                return Some(cached.block.clone());
            }
        }
        match self.store.get_block(block_id) {
            Ok(Some(block)) => {
                self.put(block.clone(), BlockStatus::Valid);
                Some(block)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(block = block_id, error = %err, "block store read failed");
                None
            }
        }
    }

    pub fn status(&self, block_id: &str) -> BlockStatus {
        {
            let mut inner = self.inner.lock();
            if let Some(cached) = inner.get(block_id) {
                return cached.status;
            }
        }
        match self.store.has_block(block_id) {
            Ok(true) => BlockStatus::Valid,
            _ => BlockStatus::Unknown,
        }
    }

    pub fn set_status(&self, block_id: &str, status: BlockStatus) {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.get_mut(block_id) {
            cached.status = status;
        }
    }

    pub fn contains(&self, block_id: &str) -> bool {
        if self.inner.lock().contains(block_id) {
            return true;
        }
        self.store.has_block(block_id).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }
}

impl ConsensusBlockReader for BlockCache {
    fn chain_head(&self) -> Option<Block> {
        self.store.chain_head().ok().flatten()
    }

    fn get_block(&self, block_id: &str) -> Option<Block> {
        self.get(block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sawtooth_crypto::PrivateKey;
    use sawtooth_types::{BlockBuilder, NULL_BLOCK_IDENTIFIER};

    fn chain_of(len: u64) -> Vec<Block> {
        let signer = PrivateKey::generate();
        let mut blocks = Vec::new();
        let mut previous = NULL_BLOCK_IDENTIFIER.to_string();
        for num in 0..len {
            let block = BlockBuilder::new(num, previous.clone())
                .state_root_hash("00".repeat(32))
                .build(&signer)
                .unwrap();
            previous = block.id().to_string();
            blocks.push(block);
        }
        blocks
    }

    fn empty_store() -> Arc<ChainStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        // Keep the tempdir alive for the store's lifetime.
        std::mem::forget(dir);
        store
    }

    #[test]
    fn store_hits_become_valid() {
        let store = empty_store();
        let chain = chain_of(2);
        store.put_chain_head(&chain, &[], &[]).unwrap();

        let cache = BlockCache::new(store, 10);
        assert_eq!(cache.status(chain[0].id()), BlockStatus::Valid);
        assert!(cache.get(chain[1].id()).is_some());
        assert!(!cache.contains("unknown"));
    }

    #[test]
    fn status_marking() {
        let store = empty_store();
        let cache = BlockCache::new(store, 10);
        let chain = chain_of(1);
        cache.put(chain[0].clone(), BlockStatus::Unknown);
        assert_eq!(cache.status(chain[0].id()), BlockStatus::Unknown);
        cache.set_status(chain[0].id(), BlockStatus::Invalid);
        assert_eq!(cache.status(chain[0].id()), BlockStatus::Invalid);
    }

    #[test]
    fn eviction_skips_referenced_predecessors() {
        let store = empty_store();
        let cache = BlockCache::new(store, 2);
        let chain = chain_of(3);
        // chain[0] is predecessor of chain[1]; chain[1] of chain[2].
        cache.put(chain[0].clone(), BlockStatus::Valid);
        cache.put(chain[1].clone(), BlockStatus::Valid);
        cache.put(chain[2].clone(), BlockStatus::Unknown);

        // Over capacity: everything except the unreferenced tip is pinned,
        // so the cache keeps the chain intact.
        assert!(cache.len() >= 2);
        assert!(cache.contains(chain[1].id()));
        assert!(cache.contains(chain[2].id()));
    }

    #[test]
    fn rebuilds_from_store_on_startup() {
        let store = empty_store();
        let chain = chain_of(3);
        store.put_chain_head(&chain, &[], &[]).unwrap();
        let cache = BlockCache::new(store, 2);
        assert!(!cache.is_empty());
        assert_eq!(cache.status(chain[2].id()), BlockStatus::Valid);
    }
}
