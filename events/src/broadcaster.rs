// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    extractor::extract_block_events,
    filter::{CompiledSubscription, EventSubscription},
};
use parking_lot::Mutex;
use sawtooth_chain_store::ChainStore;
use sawtooth_journal::ChainEvent;
use sawtooth_types::{Block, Event, TransactionReceipt};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SubscribeError {
    /// None of the announced last-known blocks is on the current chain.
    #[error("no known block among the announced ids")]
    UnknownBlock,
    /// A regex filter failed to compile.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// The catch-up window exceeds the subscriber queue.
    #[error("subscriber queue too small for catch-up")]
    Backlogged,
    #[error("chain store error: {0}")]
    Store(String),
}

/// The per-block event bundle a subscriber receives.
#[derive(Clone, Debug)]
pub struct EventList {
    pub block_id: String,
    pub block_num: u64,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug)]
pub struct EventBroadcasterConfig {
    /// Bound of each subscriber queue; a subscriber that falls this far
    /// behind live delivery is dropped.
    pub queue_depth: usize,
}

impl Default for EventBroadcasterConfig {
    fn default() -> Self {
        Self { queue_depth: 256 }
    }
}

struct Subscriber {
    subscriptions: Vec<CompiledSubscription>,
    sender: mpsc::Sender<EventList>,
    /// Blocks already delivered (catch-up may overlap the live feed).
    delivered: HashSet<String>,
}

/// Fans committed-block events out to subscribers, replaying history first
/// for clients that announce their last known blocks.
pub struct EventBroadcaster {
    store: Arc<ChainStore>,
    config: EventBroadcasterConfig,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBroadcaster {
    pub fn new(store: Arc<ChainStore>, config: EventBroadcasterConfig) -> Self {
        Self {
            store,
            config,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a subscriber. When `last_known_block_ids` is non-empty,
    /// events from the most recent of them that is on the current chain are
    /// replayed (exclusive) before live events begin; none matching is an
    /// error.
    pub fn subscribe(
        &self,
        subscriptions: &[EventSubscription],
        last_known_block_ids: &[String],
    ) -> Result<mpsc::Receiver<EventList>, SubscribeError> {
        let compiled: Vec<CompiledSubscription> = subscriptions
            .iter()
            .map(CompiledSubscription::compile)
            .collect::<Result<_, _>>()
            .map_err(|err| SubscribeError::InvalidFilter(err.to_string()))?;

        // Everything after this point happens with the subscriber table
        // locked, so no commit can interleave with the catch-up snapshot.
        let mut subscribers = self.subscribers.lock();

        let catch_up = if last_known_block_ids.is_empty() {
            Vec::new()
        } else {
            self.catch_up_blocks(last_known_block_ids)?
        };

        let (sender, receiver) = mpsc::channel(self.config.queue_depth);
        let mut subscriber = Subscriber {
            subscriptions: compiled,
            sender,
            delivered: HashSet::new(),
        };
        for (block, receipts) in catch_up {
            let Some(list) = filtered_event_list(&subscriber.subscriptions, &block, &receipts)
            else {
                subscriber.delivered.insert(block.id().to_string());
                continue;
            };
            subscriber.delivered.insert(list.block_id.clone());
            if subscriber.sender.try_send(list).is_err() {
                return Err(SubscribeError::Backlogged);
            }
        }
        subscribers.push(subscriber);
        Ok(receiver)
    }

    /// The committed blocks after the most recent known ancestor, oldest
    /// first, with their receipts.
    fn catch_up_blocks(
        &self,
        last_known_block_ids: &[String],
    ) -> Result<Vec<(Block, Vec<TransactionReceipt>)>, SubscribeError> {
        let known: HashSet<&String> = last_known_block_ids.iter().collect();
        let mut newer: Vec<Block> = Vec::new();
        let mut anchored = false;
        for block in self.store.chain_iter() {
            let block = block.map_err(|err| SubscribeError::Store(err.to_string()))?;
            if known.contains(&block.id().to_string()) {
                anchored = true;
                break;
            }
            newer.push(block);
        }
        if !anchored {
            return Err(SubscribeError::UnknownBlock);
        }

        newer.reverse();
        let mut out = Vec::with_capacity(newer.len());
        for block in newer {
            let mut receipts = Vec::new();
            for batch in &block.batches {
                for txn_id in batch.transaction_ids() {
                    match self.store.get_receipt(txn_id) {
                        Ok(Some(receipt)) => receipts.push(receipt),
                        Ok(None) => {}
                        Err(err) => return Err(SubscribeError::Store(err.to_string())),
                    }
                }
            }
            out.push((block, receipts));
        }
        Ok(out)
    }

    /// Live delivery of one committed block.
    pub fn on_chain_event(&self, event: &ChainEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|subscriber| {
            if subscriber.delivered.contains(event.block.id()) {
                return true;
            }
            let Some(list) =
                filtered_event_list(&subscriber.subscriptions, &event.block, &event.receipts)
            else {
                subscriber.delivered.insert(event.block.id().to_string());
                return true;
            };
            subscriber.delivered.insert(list.block_id.clone());
            match subscriber.sender.try_send(list) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("dropping event subscriber that fell too far behind");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

fn filtered_event_list(
    subscriptions: &[CompiledSubscription],
    block: &Block,
    receipts: &[TransactionReceipt],
) -> Option<EventList> {
    let header = block.header().ok()?;
    let events: Vec<Event> = extract_block_events(block, receipts)
        .into_iter()
        .filter(|event| subscriptions.iter().any(|sub| sub.matches(event)))
        .collect();
    if events.is_empty() {
        return None;
    }
    Some(EventList {
        block_id: block.id().to_string(),
        block_num: header.block_num,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extractor::BLOCK_COMMIT_EVENT_TYPE, filter::FilterType, EventFilterSpec};
    use claims::{assert_err, assert_ok};
    use sawtooth_crypto::PrivateKey;
    use sawtooth_types::{BlockBuilder, NULL_BLOCK_IDENTIFIER};

    fn block_commit_subscription() -> EventSubscription {
        EventSubscription {
            event_type: BLOCK_COMMIT_EVENT_TYPE.to_string(),
            filters: vec![],
        }
    }

    fn committed_chain(store: &ChainStore, len: u64) -> Vec<Block> {
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
        store.put_chain_head(&blocks, &[], &[]).unwrap();
        blocks
    }

    fn broadcaster() -> (EventBroadcaster, Arc<ChainStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        std::mem::forget(dir);
        (
            EventBroadcaster::new(store.clone(), EventBroadcasterConfig::default()),
            store,
        )
    }

    #[test]
    fn catch_up_replays_in_order_before_live_events() {
        let (broadcaster, store) = broadcaster();
        let chain = committed_chain(&store, 4);

        // Client last saw block 1; expects 2 and 3 replayed.
        let mut receiver = broadcaster
            .subscribe(
                &[block_commit_subscription()],
                &[chain[1].id().to_string()],
            )
            .unwrap();
        let first = receiver.try_recv().unwrap();
        let second = receiver.try_recv().unwrap();
        assert_eq!(first.block_id, chain[2].id());
        assert_eq!(second.block_id, chain[3].id());
        assert!(receiver.try_recv().is_err());

        // A live commit follows the replay.
        let signer = PrivateKey::generate();
        let live = BlockBuilder::new(4, chain[3].id())
            .state_root_hash("00".repeat(32))
            .build(&signer)
            .unwrap();
        broadcaster.on_chain_event(&ChainEvent {
            block: live.clone(),
            receipts: vec![],
        });
        assert_eq!(receiver.try_recv().unwrap().block_id, live.id());
    }

    #[test]
    fn unknown_last_block_is_rejected() {
        let (broadcaster, store) = broadcaster();
        committed_chain(&store, 2);
        assert_err!(broadcaster.subscribe(
            &[block_commit_subscription()],
            &["does-not-exist".to_string()]
        ));
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let (broadcaster, _store) = broadcaster();
        let bad = EventSubscription {
            event_type: BLOCK_COMMIT_EVENT_TYPE.to_string(),
            filters: vec![EventFilterSpec {
                key: "block_id".to_string(),
                match_string: "[unclosed".to_string(),
                filter_type: FilterType::RegexAny,
            }],
        };
        assert!(matches!(
            broadcaster.subscribe(&[bad], &[]),
            Err(SubscribeError::InvalidFilter(_))
        ));
    }

    #[test]
    fn live_duplicate_of_catch_up_is_suppressed() {
        let (broadcaster, store) = broadcaster();
        let chain = committed_chain(&store, 2);
        let mut receiver = broadcaster
            .subscribe(
                &[block_commit_subscription()],
                &[chain[0].id().to_string()],
            )
            .unwrap();
        assert_eq!(receiver.try_recv().unwrap().block_id, chain[1].id());

        // The same block arriving on the live path is not re-delivered.
        broadcaster.on_chain_event(&ChainEvent {
            block: chain[1].clone(),
            receipts: vec![],
        });
        assert!(receiver.try_recv().is_err());
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn subscribe_without_history_gets_only_live_events() {
        let (broadcaster, store) = broadcaster();
        let chain = committed_chain(&store, 2);
        let mut receiver = assert_ok!(broadcaster.subscribe(&[block_commit_subscription()], &[]));
        assert!(receiver.try_recv().is_err());
        broadcaster.on_chain_event(&ChainEvent {
            block: chain[1].clone(),
            receipts: vec![],
        });
        assert_eq!(receiver.try_recv().unwrap().block_id, chain[1].id());
    }
}
