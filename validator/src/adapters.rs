// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Glue between the journal's traits and the network service.

use sawtooth_chain_store::ChainStore;
use sawtooth_journal::{BlockBroadcaster, BlockCache, Completer, RequestSender};
use sawtooth_network::{GossipHandler, NetworkService};
use sawtooth_types::{Batch, Block};
use std::sync::Arc;
use tracing::debug;

/// Published blocks go to the local completer and out to the gossip mesh.
pub struct BroadcastFanout {
    completer: Arc<Completer>,
    network: Option<Arc<NetworkService>>,
}

impl BroadcastFanout {
    pub fn new(completer: Arc<Completer>, network: Option<Arc<NetworkService>>) -> Self {
        Self { completer, network }
    }
}

impl BlockBroadcaster for BroadcastFanout {
    fn broadcast_block(&self, block: Block) {
        if let Some(network) = &self.network {
            network.broadcast_block(block.clone());
        }
        self.completer.on_block_received(block);
    }
}

/// The completer's missing-dependency requests become gossip floods.
pub struct PeerRequestSender {
    network: Arc<NetworkService>,
}

impl PeerRequestSender {
    pub fn new(network: Arc<NetworkService>) -> Self {
        Self { network }
    }
}

impl RequestSender for PeerRequestSender {
    fn request_block(&self, block_id: &str) {
        self.network.request_block(block_id.to_string());
    }

    fn request_batches_by_transaction(&self, txn_ids: &[String]) {
        self.network
            .request_batches_by_transactions(txn_ids.to_vec());
    }
}

/// Gossip arrivals feed the completer; gossip requests are answered from
/// local storage.
pub struct GossipGlue {
    completer: Arc<Completer>,
    store: Arc<ChainStore>,
    cache: Arc<BlockCache>,
}

impl GossipGlue {
    pub fn new(completer: Arc<Completer>, store: Arc<ChainStore>, cache: Arc<BlockCache>) -> Self {
        Self {
            completer,
            store,
            cache,
        }
    }
}

impl GossipHandler for GossipGlue {
    fn on_block(&self, block: Block) {
        debug!(block = %block.id(), "block arrived via gossip");
        self.completer.on_block_received(block);
    }

    fn on_batch(&self, batch: Batch) {
        debug!(batch = %batch.id(), "batch arrived via gossip");
        self.completer.on_batch_received(batch);
    }

    fn fetch_block(&self, block_id: &str) -> Option<Block> {
        self.cache.get(block_id)
    }

    fn fetch_batches_by_transactions(&self, txn_ids: &[String]) -> Vec<Batch> {
        txn_ids
            .iter()
            .filter_map(|txn_id| {
                self.store
                    .get_batch_by_transaction_id(txn_id)
                    .ok()
                    .flatten()
            })
            .collect()
    }
}
