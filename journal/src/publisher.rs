// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Builds candidate blocks: Idle → Building → (summarize → finalize) → Idle.
//!
//! While Building, completed batches stream into a speculative schedule
//! executed in the background. When consensus says publish, the batch list
//! is frozen, failed batches are dropped from the candidate, the state root
//! is taken from the schedule's final squash, and the signed block is
//! broadcast. A chain-head move cancels whatever is in flight.

use crate::{
    block_cache::BlockCache,
    chain_controller::ChainHeadListener,
    completer::BatchSink,
    injector::{BatchInjector, InjectorRegistry},
};
use parking_lot::Mutex;
use sawtooth_consensus::ConsensusEngine;
use sawtooth_crypto::PrivateKey;
use sawtooth_executor::{ExecutorConfig, ProcessorRegistry, TransactionExecutor};
use sawtooth_scheduler::{Scheduler, SchedulerKind};
use sawtooth_state::{ContextManager, SettingsView};
use sawtooth_types::{Batch, Block, BlockBuilder, BlockHeader};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("publisher is not idle")]
    NotIdle,
    #[error("no block in progress")]
    NotBuilding,
    #[error("consensus rejected the operation: {0}")]
    ConsensusRejected(String),
    #[error("candidate block has no valid batches")]
    EmptyCandidate,
    #[error("scheduling failed: {0}")]
    Scheduling(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Where finished blocks go: the local completer and the gossip network.
pub trait BlockBroadcaster: Send + Sync {
    fn broadcast_block(&self, block: Block);
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub scheduler_kind: SchedulerKind,
    pub executor_config: ExecutorConfig,
    /// Poll interval of the publisher loop.
    pub tick: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            scheduler_kind: SchedulerKind::Parallel,
            executor_config: ExecutorConfig::default(),
            tick: Duration::from_millis(100),
        }
    }
}

struct Candidate {
    previous: Block,
    previous_header: BlockHeader,
    scheduler: Scheduler,
    executor_handle: Option<JoinHandle<()>>,
    injectors: Vec<Arc<dyn BatchInjector>>,
    /// Every batch fed to the schedule, in order, with whether it came from
    /// the pending queue (and should return there on cancel).
    batches: Vec<(Batch, bool)>,
}

enum Phase {
    Idle,
    Building(Candidate),
}

struct PendingBatches {
    queue: VecDeque<Batch>,
    known: HashSet<String>,
}

pub struct BlockPublisher {
    context_manager: Arc<ContextManager>,
    registry: Arc<ProcessorRegistry>,
    consensus: Arc<ConsensusEngine>,
    injector_registry: Arc<InjectorRegistry>,
    cache: Arc<BlockCache>,
    signer: PrivateKey,
    config: PublisherConfig,
    broadcaster: Mutex<Option<Arc<dyn BlockBroadcaster>>>,
    phase: Mutex<Phase>,
    pending: Mutex<PendingBatches>,
}

impl BlockPublisher {
    pub fn new(
        context_manager: Arc<ContextManager>,
        registry: Arc<ProcessorRegistry>,
        consensus: Arc<ConsensusEngine>,
        injector_registry: Arc<InjectorRegistry>,
        cache: Arc<BlockCache>,
        signer: PrivateKey,
        config: PublisherConfig,
    ) -> Self {
        Self {
            context_manager,
            registry,
            consensus,
            injector_registry,
            cache,
            signer,
            config,
            broadcaster: Mutex::new(None),
            phase: Mutex::new(Phase::Idle),
            pending: Mutex::new(PendingBatches {
                queue: VecDeque::new(),
                known: HashSet::new(),
            }),
        }
    }

    pub fn set_broadcaster(&self, broadcaster: Arc<dyn BlockBroadcaster>) {
        *self.broadcaster.lock() = Some(broadcaster);
    }

    pub fn pending_batch_count(&self) -> usize {
        self.pending.lock().queue.len()
    }

    /// Queues a batch, and feeds it straight into the candidate block when
    /// one is being built.
    pub fn on_batch_received(&self, batch: Batch) {
        {
            let mut pending = self.pending.lock();
            if pending.known.contains(batch.id())
                || self.cache.store().has_batch(batch.id()).unwrap_or(false)
            {
                return;
            }
            pending.known.insert(batch.id().to_string());
            pending.queue.push_back(batch);
        }
        let mut phase = self.phase.lock();
        if let Phase::Building(candidate) = &mut *phase {
            Self::drain_pending(&self.pending, candidate);
        }
    }

    /// Opens a candidate block on top of `previous`.
    pub fn start_block(&self, previous: &Block) -> Result<(), PublisherError> {
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Idle) {
            return Err(PublisherError::NotIdle);
        }
        let previous_header = previous
            .header()
            .map_err(|err| PublisherError::Scheduling(err.to_string()))?;

        self.consensus
            .publisher
            .initialize_block(&previous_header)
            .map_err(|err| PublisherError::ConsensusRejected(err.to_string()))?;

        let scheduler = Scheduler::new(
            self.config.scheduler_kind,
            self.context_manager.clone(),
            &previous_header.state_root_hash,
            false,
        );

        // The executor drains the schedule in the background while batches
        // keep arriving.
        let executor = TransactionExecutor::new(
            self.registry.clone(),
            self.context_manager.clone(),
            self.config.executor_config.clone(),
        );
        let executor_scheduler = scheduler.clone();
        let executor_handle = std::thread::Builder::new()
            .name("publisher-executor".to_string())
            .spawn(move || {
                executor.execute(&executor_scheduler);
            })
            .map_err(|err| PublisherError::Scheduling(err.to_string()))?;

        let injectors = match SettingsView::new(
            self.context_manager.node_store(),
            &previous_header.state_root_hash,
        ) {
            Ok(settings) => self.injector_registry.resolve(&settings),
            Err(err) => {
                warn!(error = %err, "no settings view for injector resolution");
                Vec::new()
            }
        };

        let mut candidate = Candidate {
            previous: previous.clone(),
            previous_header,
            scheduler,
            executor_handle: Some(executor_handle),
            injectors,
            batches: Vec::new(),
        };

        for injector in candidate.injectors.clone() {
            for injected in injector.block_start(&candidate.previous) {
                Self::feed(&mut candidate, injected, false);
            }
        }
        Self::drain_pending(&self.pending, &mut candidate);

        debug!(previous = %previous.id(), "candidate block opened");
        *phase = Phase::Building(candidate);
        Ok(())
    }

    fn drain_pending(pending: &Mutex<PendingBatches>, candidate: &mut Candidate) {
        loop {
            let Some(batch) = pending.lock().queue.pop_front() else {
                break;
            };
            for injector in candidate.injectors.clone() {
                for injected in injector.before_batch(&candidate.previous, &batch) {
                    Self::feed(candidate, injected, false);
                }
            }
            let after_sources: Vec<Arc<dyn BatchInjector>> = candidate.injectors.clone();
            let batch_for_after = batch.clone();
            Self::feed(candidate, batch, true);
            for injector in after_sources {
                for injected in injector.after_batch(&candidate.previous, &batch_for_after) {
                    Self::feed(candidate, injected, false);
                }
            }
        }
    }

    fn feed(candidate: &mut Candidate, batch: Batch, from_pending: bool) {
        match candidate.scheduler.add_batch(batch.clone(), None) {
            Ok(()) => candidate.batches.push((batch, from_pending)),
            Err(err) => warn!(batch = %batch.id(), error = %err, "could not schedule batch"),
        }
    }

    /// Whether consensus wants the in-progress block published.
    pub fn check_publish(&self) -> bool {
        let phase = self.phase.lock();
        match &*phase {
            Phase::Building(candidate) => {
                let provisional = BlockHeader {
                    block_num: candidate.previous_header.block_num + 1,
                    previous_block_id: candidate.previous.id().to_string(),
                    signer_public_key: self.signer.public_key().as_hex(),
                    batch_ids: candidate
                        .batches
                        .iter()
                        .map(|(batch, _)| batch.id().to_string())
                        .collect(),
                    consensus: Vec::new(),
                    state_root_hash: String::new(),
                };
                !candidate.batches.is_empty()
                    && self.consensus.publisher.check_publish_block(&provisional)
            }
            Phase::Idle => false,
        }
    }

    /// Freezes the candidate, completes execution, drops failed batches,
    /// fills the header (consensus bytes included), signs and broadcasts.
    pub fn finalize_block(&self) -> Result<Block, PublisherError> {
        let mut phase = self.phase.lock();
        let Phase::Building(mut candidate) = std::mem::replace(&mut *phase, Phase::Idle) else {
            return Err(PublisherError::NotBuilding);
        };
        drop(phase);

        for injector in candidate.injectors.clone() {
            let so_far: Vec<Batch> = candidate
                .batches
                .iter()
                .map(|(batch, _)| batch.clone())
                .collect();
            for injected in injector.block_end(&candidate.previous, &so_far) {
                Self::feed(&mut candidate, injected, false);
            }
        }

        candidate
            .scheduler
            .finalize()
            .map_err(|err| PublisherError::Scheduling(err.to_string()))?;
        candidate.scheduler.complete(true);
        if let Some(handle) = candidate.executor_handle.take() {
            let _ = handle.join();
        }

        // Only batches that executed cleanly make it into the block.
        let results = candidate.scheduler.batch_execution_results();
        let valid_ids: HashSet<&str> = results
            .iter()
            .filter(|result| result.is_valid)
            .map(|result| result.batch_id.as_str())
            .collect();
        let batches: Vec<Batch> = candidate
            .batches
            .iter()
            .filter(|(batch, _)| valid_ids.contains(batch.id()))
            .map(|(batch, _)| batch.clone())
            .collect();
        let state_root = candidate.scheduler.final_state_hash();
        candidate.scheduler.cancel();

        if batches.is_empty() {
            return Err(PublisherError::EmptyCandidate);
        }
        let state_root = state_root
            .ok_or_else(|| PublisherError::Scheduling("no final state hash".to_string()))?;

        let mut header = BlockHeader {
            block_num: candidate.previous_header.block_num + 1,
            previous_block_id: candidate.previous.id().to_string(),
            signer_public_key: self.signer.public_key().as_hex(),
            batch_ids: batches.iter().map(|batch| batch.id().to_string()).collect(),
            consensus: Vec::new(),
            state_root_hash: state_root.clone(),
        };
        header.consensus = self
            .consensus
            .publisher
            .finalize_block(&header)
            .map_err(|err| PublisherError::ConsensusRejected(err.to_string()))?;

        let block = BlockBuilder::new(header.block_num, header.previous_block_id.clone())
            .state_root_hash(state_root)
            .consensus(header.consensus.clone())
            .batches(batches)
            .build(&self.signer)
            .map_err(|err| PublisherError::Signing(err.to_string()))?;

        info!(block = %block.id(), num = header.block_num, "block published");
        let broadcaster = self.broadcaster.lock().clone();
        if let Some(broadcaster) = broadcaster {
            broadcaster.broadcast_block(block.clone());
        }
        Ok(block)
    }

    /// Discards the in-flight candidate; its pending-queue batches return
    /// to the queue.
    pub fn cancel_block(&self) {
        let mut phase = self.phase.lock();
        if let Phase::Building(mut candidate) = std::mem::replace(&mut *phase, Phase::Idle) {
            candidate.scheduler.cancel();
            if let Some(handle) = candidate.executor_handle.take() {
                let _ = handle.join();
            }
            let mut pending = self.pending.lock();
            for (batch, from_pending) in candidate.batches.drain(..).rev() {
                if from_pending {
                    pending.queue.push_front(batch);
                }
            }
            debug!("candidate block cancelled");
        }
    }

    /// Drops queued batches that the new chain already committed.
    fn purge_committed(&self) {
        let mut pending = self.pending.lock();
        let store = self.cache.store().clone();
        pending
            .queue
            .retain(|batch| !store.has_batch(batch.id()).unwrap_or(false));
        let still_queued: HashSet<String> = pending
            .queue
            .iter()
            .map(|batch| batch.id().to_string())
            .collect();
        pending.known = still_queued;
    }

    /// One pass of the publisher loop; the validator wires this into a
    /// dedicated thread ticking at `config.tick`.
    pub fn tick(&self) {
        let is_idle = matches!(*self.phase.lock(), Phase::Idle);
        if is_idle {
            if let Ok(Some(head)) = self.cache.store().chain_head() {
                if let Err(err) = self.start_block(&head) {
                    debug!(error = %err, "could not open candidate block");
                }
            }
        } else if self.check_publish() {
            match self.finalize_block() {
                Ok(_) | Err(PublisherError::EmptyCandidate) => {}
                Err(err) => warn!(error = %err, "publish failed"),
            }
        }
    }

    pub fn run(&self, shutdown: crossbeam_channel::Receiver<()>) {
        loop {
            match shutdown.recv_timeout(self.config.tick) {
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.cancel_block();
                    return;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => self.tick(),
            }
        }
    }
}

impl BatchSink for BlockPublisher {
    fn on_batch_complete(&self, batch: Batch) {
        self.on_batch_received(batch);
    }
}

impl ChainHeadListener for BlockPublisher {
    fn on_chain_updated(&self, new_head: Block) {
        debug!(head = %new_head.id(), "chain head moved; restarting candidate");
        self.cancel_block();
        self.purge_committed();
    }
}
