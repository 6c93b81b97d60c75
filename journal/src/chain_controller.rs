// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Receives completed blocks, validates candidate forks on a bounded pool,
//! resolves forks through consensus, and applies chain-head switches
//! atomically.
//!
//! Head updates are serialized under a single lock; validations run in
//! parallel. A validation that loses a race with a head update is simply
//! restarted against the new head.

use crate::{
    block_cache::{BlockCache, BlockStatus},
    block_validator::{BlockValidator, ChainCommitState, ValidationFailure},
    completer::BlockSink,
};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use sawtooth_chain_store::ChainStore;
use sawtooth_consensus::ForkDecision;
use sawtooth_merkle::empty_tree_root;
use sawtooth_types::{Block, TransactionReceipt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use threadpool::ThreadPool;
use tracing::{debug, error, info, warn};

/// Told when the committed head moves; the publisher restarts its candidate
/// block on this signal.
pub trait ChainHeadListener: Send + Sync {
    fn on_chain_updated(&self, new_head: Block);
}

/// One committed block with its receipts, delivered to chain observers in
/// commit order.
#[derive(Clone, Debug)]
pub struct ChainEvent {
    pub block: Block,
    pub receipts: Vec<TransactionReceipt>,
}

#[derive(Clone, Debug)]
pub struct ChainControllerConfig {
    pub validation_pool_size: usize,
    /// Bound of each observer's event queue; a subscriber that falls this
    /// far behind is dropped.
    pub observer_queue_depth: usize,
    /// How many times a retryable validation failure is re-attempted.
    pub max_validation_attempts: u32,
}

impl Default for ChainControllerConfig {
    fn default() -> Self {
        Self {
            validation_pool_size: 2,
            observer_queue_depth: 128,
            max_validation_attempts: 3,
        }
    }
}

pub struct ChainController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<ChainStore>,
    cache: Arc<BlockCache>,
    validator: Arc<BlockValidator>,
    config: ChainControllerConfig,
    /// Serializes every chain-head read-check-update sequence.
    head_lock: Mutex<()>,
    pool: Mutex<ThreadPool>,
    listener: Mutex<Option<Arc<dyn ChainHeadListener>>>,
    observers: Mutex<Vec<Sender<ChainEvent>>>,
    /// Receipts of validated-but-not-yet-committed candidate blocks.
    receipts: Mutex<HashMap<String, Vec<TransactionReceipt>>>,
    fatal: AtomicBool,
}

impl Clone for ChainController {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ChainController {
    pub fn new(
        store: Arc<ChainStore>,
        cache: Arc<BlockCache>,
        validator: Arc<BlockValidator>,
        config: ChainControllerConfig,
    ) -> Self {
        let pool = ThreadPool::new(config.validation_pool_size.max(1));
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                validator,
                config,
                head_lock: Mutex::new(()),
                pool: Mutex::new(pool),
                listener: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                receipts: Mutex::new(HashMap::new()),
                fatal: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_chain_head_listener(&self, listener: Arc<dyn ChainHeadListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Registers a commit observer; events arrive in commit order on the
    /// returned channel.
    pub fn add_observer(&self) -> Receiver<ChainEvent> {
        let (sender, receiver) = bounded(self.inner.config.observer_queue_depth);
        self.inner.observers.lock().push(sender);
        receiver
    }

    /// A fatal storage-level inconsistency was observed; the process should
    /// exit.
    pub fn has_fatal_error(&self) -> bool {
        self.inner.fatal.load(Ordering::SeqCst)
    }

    /// Blocks until all in-flight validations have drained. Test and
    /// shutdown aid.
    pub fn join(&self) {
        self.inner.pool.lock().join();
    }

    /// Hands a completed candidate block to the validation pool.
    pub fn on_block_received(&self, block: Block) {
        self.inner.cache.put(block.clone(), BlockStatus::Unknown);
        let controller = self.clone();
        self.inner.pool.lock().execute(move || {
            controller.process_candidate(block);
        });
    }

    fn process_candidate(&self, block: Block) {
        for _attempt in 0..self.inner.config.max_validation_attempts {
            match self.consider_candidate(&block) {
                Ok(ConsiderOutcome::Committed) | Ok(ConsiderOutcome::Rejected) => return,
                Ok(ConsiderOutcome::HeadMovedRestart) => continue,
                Err(err) => {
                    warn!(block = %block.id(), error = %err, "validation attempt failed");
                    continue;
                }
            }
        }
        warn!(block = %block.id(), "giving up on candidate after repeated attempts");
    }

    fn consider_candidate(&self, block: &Block) -> Result<ConsiderOutcome, ValidationFailure> {
        let inner = &self.inner;
        let head_snapshot = inner
            .store
            .chain_head_id()
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;

        // Walk the candidate chain back to the committed chain.
        let (candidate_segment, ancestor) = match self.build_candidate_segment(block)? {
            Some(parts) => parts,
            None => return Ok(ConsiderOutcome::Rejected),
        };

        // A chain rooted in a foreign genesis can never join this one.
        if ancestor.is_none() && head_snapshot.is_some() {
            warn!(block = %block.id(), "candidate chain is rooted in a foreign genesis");
            self.mark_invalid(&candidate_segment);
            return Ok(ConsiderOutcome::Rejected);
        }

        let current_segment = self.current_segment(head_snapshot.as_deref(), ancestor.as_ref())?;

        let previous_state_root = match &ancestor {
            Some(ancestor_block) => ancestor_block
                .header()
                .map_err(|err| ValidationFailure::Retryable(err.to_string()))?
                .state_root_hash,
            None => empty_tree_root().to_string(),
        };
        let ancestor_num = match &ancestor {
            Some(ancestor_block) => Some(
                ancestor_block
                    .header()
                    .map_err(|err| ValidationFailure::Retryable(err.to_string()))?
                    .block_num,
            ),
            None => None,
        };

        // Forward-validate everything not already validated.
        let mut commit_state = ChainCommitState::new(ancestor_num);
        let mut state_root = previous_state_root;
        for candidate in &candidate_segment {
            let header = candidate
                .header()
                .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
            match inner.cache.status(candidate.id()) {
                BlockStatus::Invalid => {
                    let failed_from = candidate_segment
                        .iter()
                        .position(|b| b.id() == candidate.id())
                        .unwrap_or(0);
                    self.mark_invalid(&candidate_segment[failed_from..]);
                    return Ok(ConsiderOutcome::Rejected);
                }
                BlockStatus::Valid => {}
                BlockStatus::Unknown => {
                    match inner.validator.validate_block(
                        candidate,
                        &state_root,
                        &commit_state,
                        &inner.store,
                    ) {
                        Ok(receipts) => {
                            inner.cache.set_status(candidate.id(), BlockStatus::Valid);
                            inner
                                .receipts
                                .lock()
                                .insert(candidate.id().to_string(), receipts);
                        }
                        Err(ValidationFailure::Invalid(reason)) => {
                            warn!(block = %candidate.id(), reason, "block failed validation");
                            // The failed block and everything after it.
                            let failed_from = candidate_segment
                                .iter()
                                .position(|b| b.id() == candidate.id())
                                .unwrap_or(0);
                            self.mark_invalid(&candidate_segment[failed_from..]);
                            return Ok(ConsiderOutcome::Rejected);
                        }
                        Err(retryable) => return Err(retryable),
                    }
                }
            }
            commit_state.add_block(candidate);
            state_root = header.state_root_hash;
        }

        // Consensus decides the fork.
        let decision = inner
            .validator
            .consensus()
            .fork_resolver
            .compare_forks(&current_segment_ascending(&current_segment), &candidate_segment);
        if decision != ForkDecision::SwitchToCandidate {
            debug!(block = %block.id(), "consensus kept the current chain");
            return Ok(ConsiderOutcome::Rejected);
        }

        // Serialize the head update; restart if we lost the race.
        let _head_guard = inner.head_lock.lock();
        let head_now = inner
            .store
            .chain_head_id()
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
        if head_now != head_snapshot {
            debug!(block = %block.id(), "chain head moved during validation; restarting");
            return Ok(ConsiderOutcome::HeadMovedRestart);
        }

        let events: Vec<ChainEvent> = {
            let mut stored = self.inner.receipts.lock();
            candidate_segment
                .iter()
                .map(|committed| ChainEvent {
                    block: committed.clone(),
                    receipts: stored.remove(committed.id()).unwrap_or_default(),
                })
                .collect()
        };
        let all_receipts: Vec<TransactionReceipt> = events
            .iter()
            .flat_map(|event| event.receipts.iter().cloned())
            .collect();

        if let Err(err) =
            inner
                .store
                .put_chain_head(&candidate_segment, &current_segment, &all_receipts)
        {
            // A racing head update slipping past the lock means the store
            // and controller disagree about the world; that is fatal.
            error!(error = %err, "atomic chain head update failed");
            inner.fatal.store(true, Ordering::SeqCst);
            return Ok(ConsiderOutcome::Rejected);
        }

        let new_head = candidate_segment.last().expect("non-empty commit").clone();
        info!(
            head = %new_head.id(),
            committed = candidate_segment.len(),
            decommitted = current_segment.len(),
            "chain head switched"
        );

        let listener = inner.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_chain_updated(new_head);
        }
        self.notify_observers(events);
        Ok(ConsiderOutcome::Committed)
    }

    /// The candidate's uncommitted chain (ascending) plus the committed
    /// block it forks from, when one exists. `Ok(None)` means the chain
    /// cannot be assembled at all.
    #[allow(clippy::type_complexity)]
    fn build_candidate_segment(
        &self,
        block: &Block,
    ) -> Result<Option<(Vec<Block>, Option<Block>)>, ValidationFailure> {
        let mut segment = vec![block.clone()];
        let mut cursor = block
            .header()
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
        loop {
            if cursor.is_genesis() {
                return Ok(Some((reversed(segment), None)));
            }
            let previous_id = cursor.previous_block_id.clone();
            if self.inner.store.has_block(&previous_id).unwrap_or(false) {
                let ancestor = self
                    .inner
                    .store
                    .get_block(&previous_id)
                    .map_err(|err| ValidationFailure::Retryable(err.to_string()))?
                    .expect("has_block checked");
                return Ok(Some((reversed(segment), Some(ancestor))));
            }
            match self.inner.cache.get(&previous_id) {
                Some(previous) => {
                    cursor = previous
                        .header()
                        .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
                    segment.push(previous);
                }
                None => {
                    // The completer should have prevented this; without the
                    // predecessor the chain cannot be evaluated.
                    warn!(block = %block.id(), missing = %previous_id, "candidate chain is missing a predecessor");
                    return Ok(None);
                }
            }
        }
    }

    /// Committed blocks above the common ancestor, ordered newest first
    /// (the decommit order).
    fn current_segment(
        &self,
        head: Option<&str>,
        ancestor: Option<&Block>,
    ) -> Result<Vec<Block>, ValidationFailure> {
        let Some(head_id) = head else {
            return Ok(Vec::new());
        };
        let stop_at = ancestor.map(|block| block.id().to_string());
        let mut segment = Vec::new();
        let mut cursor = Some(head_id.to_string());
        while let Some(current_id) = cursor {
            if Some(&current_id) == stop_at.as_ref() {
                break;
            }
            let current = self
                .inner
                .store
                .get_block(&current_id)
                .map_err(|err| ValidationFailure::Retryable(err.to_string()))?
                .ok_or_else(|| {
                    ValidationFailure::Retryable(format!("missing committed block {current_id}"))
                })?;
            let header = current
                .header()
                .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
            segment.push(current);
            cursor = (!header.is_genesis()).then_some(header.previous_block_id);
        }
        Ok(segment)
    }

    fn mark_invalid(&self, blocks: &[Block]) {
        for block in blocks {
            self.inner.cache.set_status(block.id(), BlockStatus::Invalid);
            self.inner.receipts.lock().remove(block.id());
        }
    }

    fn notify_observers(&self, events: Vec<ChainEvent>) {
        let mut observers = self.inner.observers.lock();
        for event in events {
            observers.retain(|observer| match observer.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("dropping chain observer that fell too far behind");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
    }
}

impl BlockSink for ChainController {
    fn on_block_complete(&self, block: Block) {
        self.on_block_received(block);
    }
}

enum ConsiderOutcome {
    Committed,
    Rejected,
    HeadMovedRestart,
}

fn reversed(mut blocks: Vec<Block>) -> Vec<Block> {
    blocks.reverse();
    blocks
}

/// The fork resolver wants both chains ascending from the ancestor.
fn current_segment_ascending(segment: &[Block]) -> Vec<Block> {
    let mut ascending = segment.to_vec();
    ascending.reverse();
    ascending
}
