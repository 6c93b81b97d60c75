// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Holds inbound blocks and batches until everything they reference is
//! present, requesting the missing pieces from peers with exponential
//! backoff and dropping items (and their dependents) that never complete.

use crate::block_cache::BlockCache;
use parking_lot::Mutex;
use sawtooth_types::{validation, Batch, Block};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Receives blocks whose predecessor chain is available.
pub trait BlockSink: Send + Sync {
    fn on_block_complete(&self, block: Block);
}

/// Receives batches whose declared dependencies are satisfied.
pub trait BatchSink: Send + Sync {
    fn on_batch_complete(&self, batch: Batch);
}

/// Outbound requests for missing artifacts.
pub trait RequestSender: Send + Sync {
    fn request_block(&self, block_id: &str);
    fn request_batches_by_transaction(&self, txn_ids: &[String]);
}

/// A request sender for single-node deployments: missing dependencies can
/// only ever arrive by resubmission.
pub struct NullRequestSender;

impl RequestSender for NullRequestSender {
    fn request_block(&self, _block_id: &str) {}
    fn request_batches_by_transaction(&self, _txn_ids: &[String]) {}
}

#[derive(Clone, Debug)]
pub struct CompleterConfig {
    pub initial_retry: Duration,
    pub max_retry: Duration,
    pub ttl: Duration,
}

impl Default for CompleterConfig {
    fn default() -> Self {
        Self {
            initial_retry: Duration::from_millis(500),
            max_retry: Duration::from_secs(8),
            ttl: Duration::from_secs(60),
        }
    }
}

struct PendingBlock {
    block: Block,
    attempt: u32,
    next_request: Instant,
    deadline: Instant,
}

struct PendingBatch {
    batch: Batch,
    awaiting: HashSet<String>,
    attempt: u32,
    next_request: Instant,
    deadline: Instant,
}

#[derive(Default)]
struct CompleterState {
    /// Awaited predecessor id → blocks waiting on it.
    pending_blocks: HashMap<String, Vec<PendingBlock>>,
    pending_batches: Vec<PendingBatch>,
    delivered_blocks: HashSet<String>,
    delivered_txns: HashSet<String>,
}

pub struct Completer {
    cache: Arc<BlockCache>,
    block_sink: Arc<dyn BlockSink>,
    batch_sink: Arc<dyn BatchSink>,
    request_sender: Arc<dyn RequestSender>,
    config: CompleterConfig,
    state: Mutex<CompleterState>,
}

impl Completer {
    pub fn new(
        cache: Arc<BlockCache>,
        block_sink: Arc<dyn BlockSink>,
        batch_sink: Arc<dyn BatchSink>,
        request_sender: Arc<dyn RequestSender>,
        config: CompleterConfig,
    ) -> Self {
        Self {
            cache,
            block_sink,
            batch_sink,
            request_sender,
            config,
            state: Mutex::new(CompleterState::default()),
        }
    }

    pub fn on_block_received(&self, block: Block) {
        self.block_received_at(block, Instant::now());
    }

    pub fn on_batch_received(&self, batch: Batch) {
        self.batch_received_at(batch, Instant::now());
    }

    /// Retry/expiry processing; called periodically by the owning loop.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    fn block_received_at(&self, block: Block, now: Instant) {
        // Structural completeness: signatures verify, the batch list
        // matches `batch_ids` pointwise, every referenced transaction is
        // present in its batch.
        if let Err(err) = validation::validate_block(&block) {
            warn!(block = %block.id(), error = %err, "dropping structurally invalid block");
            return;
        }
        let header = block.header().expect("validated header parses");

        let mut state = self.state.lock();
        if state.delivered_blocks.contains(block.id()) || self.cache.contains(block.id()) {
            return;
        }

        let predecessor_present = header.is_genesis()
            || state.delivered_blocks.contains(&header.previous_block_id)
            || self.cache.contains(&header.previous_block_id);
        if predecessor_present {
            self.deliver_block(&mut state, block);
        } else {
            debug!(
                block = %block.id(),
                awaiting = %header.previous_block_id,
                "holding block until its predecessor arrives"
            );
            self.request_sender.request_block(&header.previous_block_id);
            state
                .pending_blocks
                .entry(header.previous_block_id.clone())
                .or_default()
                .push(PendingBlock {
                    block,
                    attempt: 0,
                    next_request: now + self.config.initial_retry,
                    deadline: now + self.config.ttl,
                });
        }
    }

    fn deliver_block(&self, state: &mut CompleterState, block: Block) {
        let block_id = block.id().to_string();
        state.delivered_blocks.insert(block_id.clone());
        self.block_sink.on_block_complete(block);
        // Anything waiting on this block is now deliverable.
        if let Some(waiting) = state.pending_blocks.remove(&block_id) {
            for pending in waiting {
                self.deliver_block(state, pending.block);
            }
        }
    }

    fn batch_received_at(&self, batch: Batch, now: Instant) {
        if let Err(err) = validation::validate_batch(&batch) {
            warn!(batch = %batch.id(), error = %err, "dropping structurally invalid batch");
            return;
        }
        if self.cache.store().has_batch(batch.id()).unwrap_or(false) {
            return;
        }

        let mut state = self.state.lock();
        let missing = self.missing_dependencies(&state, &batch);
        if missing.is_empty() {
            self.deliver_batch(&mut state, batch);
        } else {
            debug!(batch = %batch.id(), ?missing, "holding batch on unmet dependencies");
            self.request_sender
                .request_batches_by_transaction(&missing.iter().cloned().collect::<Vec<_>>());
            state.pending_batches.push(PendingBatch {
                batch,
                awaiting: missing,
                attempt: 0,
                next_request: now + self.config.initial_retry,
                deadline: now + self.config.ttl,
            });
        }
    }

    fn missing_dependencies(&self, state: &CompleterState, batch: &Batch) -> HashSet<String> {
        let mut missing = HashSet::new();
        for txn in &batch.transactions {
            let Ok(header) = txn.header() else { continue };
            for dependency in header.dependencies {
                if state.delivered_txns.contains(&dependency) {
                    continue;
                }
                if self
                    .cache
                    .store()
                    .has_transaction(&dependency)
                    .unwrap_or(false)
                {
                    continue;
                }
                missing.insert(dependency);
            }
        }
        missing
    }

    fn deliver_batch(&self, state: &mut CompleterState, batch: Batch) {
        for txn_id in batch.transaction_ids() {
            state.delivered_txns.insert(txn_id.to_string());
        }
        self.batch_sink.on_batch_complete(batch);

        // Newly-delivered transactions may unblock held batches.
        loop {
            let ready_index = state.pending_batches.iter().position(|pending| {
                pending
                    .awaiting
                    .iter()
                    .all(|dep| state.delivered_txns.contains(dep))
            });
            match ready_index {
                Some(index) => {
                    let pending = state.pending_batches.remove(index);
                    for txn_id in pending.batch.transaction_ids() {
                        state.delivered_txns.insert(txn_id.to_string());
                    }
                    self.batch_sink.on_batch_complete(pending.batch);
                }
                None => break,
            }
        }
    }

    fn tick_at(&self, now: Instant) {
        let mut state = self.state.lock();

        // Expire blocks past their deadline, then transitively drop
        // anything that was waiting on them.
        let mut dropped: Vec<String> = Vec::new();
        for (awaited, waiting) in state.pending_blocks.iter_mut() {
            waiting.retain(|pending| {
                if now >= pending.deadline {
                    warn!(
                        block = %pending.block.id(),
                        awaited = %awaited,
                        "dropping block; dependency never arrived"
                    );
                    dropped.push(pending.block.id().to_string());
                    false
                } else {
                    true
                }
            });
        }
        while let Some(dead) = dropped.pop() {
            if let Some(descendants) = state.pending_blocks.remove(&dead) {
                for pending in descendants {
                    warn!(block = %pending.block.id(), "dropping descendant of expired block");
                    dropped.push(pending.block.id().to_string());
                }
            }
        }
        state.pending_blocks.retain(|_, waiting| !waiting.is_empty());

        state.pending_batches.retain(|pending| {
            if now >= pending.deadline {
                warn!(batch = %pending.batch.id(), "dropping batch; dependencies never arrived");
                false
            } else {
                true
            }
        });

        // Re-request whatever is still owed, with exponential backoff.
        let config = self.config.clone();
        for waiting in state.pending_blocks.values_mut() {
            for pending in waiting.iter_mut() {
                if now >= pending.next_request {
                    let header = pending.block.header().expect("validated header parses");
                    self.request_sender.request_block(&header.previous_block_id);
                    pending.attempt += 1;
                    pending.next_request = now + backoff(&config, pending.attempt);
                }
            }
        }
        for pending in state.pending_batches.iter_mut() {
            if now >= pending.next_request {
                let missing: Vec<String> = pending.awaiting.iter().cloned().collect();
                self.request_sender.request_batches_by_transaction(&missing);
                pending.attempt += 1;
                pending.next_request = now + backoff(&config, pending.attempt);
            }
        }
    }

    pub fn pending_block_count(&self) -> usize {
        self.state
            .lock()
            .pending_blocks
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn pending_batch_count(&self) -> usize {
        self.state.lock().pending_batches.len()
    }
}

fn backoff(config: &CompleterConfig, attempt: u32) -> Duration {
    let scaled = config.initial_retry.saturating_mul(1u32 << attempt.min(16));
    scaled.min(config.max_retry)
}
