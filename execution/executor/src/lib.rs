// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dispatches scheduled transactions to registered transaction processors.
//!
//! Transaction business logic is opaque to the core: a processor receives
//! the exact header bytes, the payload, the header signature, and a context
//! id, and answers OK / INVALID_TRANSACTION / INTERNAL_ERROR. The executor
//! maps those answers (plus timeouts and the retry-once rule for internal
//! errors) onto scheduler results.

mod registry;

pub use registry::{Occupancy, OccupancyGuard, ProcessorEntry, ProcessorRegistry, RegistryError};

use sawtooth_scheduler::{Scheduler, TxnInfo, TxnStatus};
use sawtooth_state::{ContextId, ContextManager};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, warn};

/// The process request handed to a transaction processor.
#[derive(Clone, Debug)]
pub struct TpProcessRequest {
    /// Exact signed header bytes.
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub signature: String,
    pub context_id: ContextId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TpProcessResponseStatus {
    Ok,
    InvalidTransaction,
    InternalError,
}

#[derive(Clone, Debug)]
pub struct TpProcessResponse {
    pub status: TpProcessResponseStatus,
    pub message: String,
    pub extended_data: Vec<u8>,
}

impl TpProcessResponse {
    pub fn ok() -> Self {
        Self {
            status: TpProcessResponseStatus::Ok,
            message: String::new(),
            extended_data: Vec::new(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: TpProcessResponseStatus::InvalidTransaction,
            message: message.into(),
            extended_data: Vec::new(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: TpProcessResponseStatus::InternalError,
            message: message.into(),
            extended_data: Vec::new(),
        }
    }
}

/// A transaction processor endpoint. In-process handlers implement this
/// directly; the network layer adapts out-of-process processors behind the
/// same seam.
pub trait TransactionProcessor: Send + Sync {
    fn process(&self, request: TpProcessRequest) -> TpProcessResponse;
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Worker threads pulling from a schedule.
    pub workers: usize,
    /// Per-request timeout when the registration does not set its own.
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Pulls released transactions from a scheduler and records their results.
pub struct TransactionExecutor {
    registry: Arc<ProcessorRegistry>,
    context_manager: Arc<ContextManager>,
    config: ExecutorConfig,
}

impl TransactionExecutor {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        context_manager: Arc<ContextManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            context_manager,
            config,
        }
    }

    /// Runs the schedule on `workers` threads. Returns once every worker
    /// has drained the schedule (i.e. the scheduler reported completion or
    /// cancellation).
    pub fn execute(&self, scheduler: &Scheduler) -> ExecutionStats {
        let stats = ExecutionStats::default();
        thread::scope(|scope| {
            for worker in 0..self.config.workers {
                let scheduler = scheduler.clone();
                let stats = &stats;
                scope.spawn(move || {
                    debug!(worker, "execution worker started");
                    while let Some(info) = scheduler.next_transaction_wait() {
                        self.execute_one(&scheduler, info, stats);
                    }
                    debug!(worker, "execution worker finished");
                });
            }
        });
        stats
    }

    fn execute_one(&self, scheduler: &Scheduler, info: TxnInfo, stats: &ExecutionStats) {
        let txn_id = info.txn.id().to_string();
        let context_id = self.context_manager.create_context(
            &info.state_root,
            info.base_context_ids.clone(),
            info.header.inputs.clone(),
            info.header.outputs.clone(),
        );

        let status = self.run_processor(&info, &context_id, stats);
        if scheduler
            .set_transaction_execution_result(&txn_id, status, Some(context_id.clone()))
            .is_err()
        {
            // The schedule was cancelled underneath us; the context is no
            // longer wanted.
            self.context_manager.delete_contexts(&[context_id]);
        }
    }

    fn run_processor(
        &self,
        info: &TxnInfo,
        context_id: &ContextId,
        stats: &ExecutionStats,
    ) -> TxnStatus {
        let Some(entry) = self
            .registry
            .get(&info.header.family_name, &info.header.family_version)
        else {
            warn!(
                family = %info.header.family_name,
                version = %info.header.family_version,
                "no registered processor for transaction family"
            );
            return TxnStatus::Invalid;
        };

        let timeout = entry.timeout.unwrap_or(self.config.default_timeout);
        let request = TpProcessRequest {
            header: info.txn.header.clone(),
            payload: info.txn.payload.clone(),
            signature: info.txn.header_signature.clone(),
            context_id: context_id.clone(),
        };

        // Occupancy guard bounds in-flight requests per processor.
        let _occupancy = entry.occupancy.acquire();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let response =
                process_with_timeout(entry.processor.clone(), request.clone(), timeout);
            match response {
                None => {
                    warn!(txn = %info.txn.id(), "processor timed out");
                    stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return TxnStatus::Invalid;
                }
                Some(response) => match response.status {
                    TpProcessResponseStatus::Ok => return TxnStatus::Valid,
                    TpProcessResponseStatus::InvalidTransaction => {
                        debug!(txn = %info.txn.id(), message = %response.message, "invalid transaction");
                        return TxnStatus::Invalid;
                    }
                    TpProcessResponseStatus::InternalError if attempts < 2 => {
                        warn!(txn = %info.txn.id(), "processor internal error; retrying once");
                    }
                    TpProcessResponseStatus::InternalError => {
                        warn!(txn = %info.txn.id(), "processor internal error twice; giving up");
                        return TxnStatus::Invalid;
                    }
                },
            }
        }
    }
}

/// Counters observed while draining one schedule. Block validation treats
/// a nonzero timeout count as a failed (retryable) validation attempt
/// rather than proof of an invalid block, since timeouts are not
/// deterministic.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub timeouts: AtomicUsize,
}

impl ExecutionStats {
    pub fn timed_out(&self) -> bool {
        self.timeouts.load(Ordering::Relaxed) > 0
    }
}

/// Runs the (synchronous) processor call on a helper thread so a hung
/// processor cannot wedge an execution worker. A timed-out call leaks the
/// helper thread; its eventual response is discarded.
fn process_with_timeout(
    processor: Arc<dyn TransactionProcessor>,
    request: TpProcessRequest,
    timeout: Duration,
) -> Option<TpProcessResponse> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let _ = sender.send(processor.process(request));
    });
    receiver.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_some_eq;
    use sawtooth_crypto::PrivateKey;
    use sawtooth_merkle::{InMemoryNodeStore, MerkleNodeStore, MerkleRadixTree};
    use sawtooth_scheduler::SchedulerKind;
    use sawtooth_types::{Address, BatchBuilder, TransactionBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(seed: u8) -> Address {
        Address::new(format!("{seed:02x}").repeat(35)).unwrap()
    }

    /// Sets the single declared output address to the payload bytes.
    struct SetProcessor {
        manager: Arc<ContextManager>,
    }

    impl TransactionProcessor for SetProcessor {
        fn process(&self, request: TpProcessRequest) -> TpProcessResponse {
            let header = sawtooth_types::TransactionHeader::from_bytes(&request.header)
                .expect("valid header");
            let address = Address::new(header.outputs[0].clone()).expect("full address");
            match self
                .manager
                .set(&request.context_id, vec![(address, request.payload)])
            {
                Ok(()) => TpProcessResponse::ok(),
                Err(err) => TpProcessResponse::invalid(err.to_string()),
            }
        }
    }

    struct FlakyProcessor {
        calls: AtomicUsize,
    }

    impl TransactionProcessor for FlakyProcessor {
        fn process(&self, _request: TpProcessRequest) -> TpProcessResponse {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                TpProcessResponse::internal_error("transient")
            } else {
                TpProcessResponse::ok()
            }
        }
    }

    struct HangingProcessor;

    impl TransactionProcessor for HangingProcessor {
        fn process(&self, _request: TpProcessRequest) -> TpProcessResponse {
            thread::sleep(Duration::from_secs(3600));
            TpProcessResponse::ok()
        }
    }

    struct Fixture {
        manager: Arc<ContextManager>,
        registry: Arc<ProcessorRegistry>,
        scheduler: Scheduler,
        store: Arc<dyn MerkleNodeStore>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn MerkleNodeStore> = Arc::new(InMemoryNodeStore::new());
        let root = MerkleRadixTree::new(store.clone(), None)
            .unwrap()
            .root_hash()
            .to_string();
        let manager = Arc::new(ContextManager::new(store.clone()));
        let registry = Arc::new(ProcessorRegistry::new());
        let scheduler = Scheduler::new(SchedulerKind::Serial, manager.clone(), &root, true);
        Fixture {
            manager,
            registry,
            scheduler,
            store,
        }
    }

    fn one_txn_batch(
        signer: &PrivateKey,
        family: &str,
        seed: u8,
        payload: &[u8],
    ) -> sawtooth_types::Batch {
        let txn = TransactionBuilder::new(family, "1.0")
            .inputs(vec![addr(seed).to_string()])
            .outputs(vec![addr(seed).to_string()])
            .payload(payload.to_vec())
            .build(signer, &signer.public_key())
            .unwrap();
        BatchBuilder::new(vec![txn]).build(signer).unwrap()
    }

    #[test]
    fn executes_a_schedule_end_to_end() {
        let fix = fixture();
        fix.registry
            .register(
                "set",
                "1.0",
                vec![],
                4,
                None,
                Arc::new(SetProcessor {
                    manager: fix.manager.clone(),
                }),
            )
            .unwrap();

        let signer = PrivateKey::generate();
        fix.scheduler
            .add_batch(one_txn_batch(&signer, "set", 1, b"ten"), None)
            .unwrap();
        fix.scheduler.finalize().unwrap();

        let executor = TransactionExecutor::new(
            fix.registry.clone(),
            fix.manager.clone(),
            ExecutorConfig::default(),
        );
        executor.execute(&fix.scheduler);

        assert!(fix.scheduler.complete(false));
        let results = fix.scheduler.batch_execution_results();
        assert!(results[0].is_valid);
        let tree = MerkleRadixTree::new(
            fix.store.clone(),
            fix.scheduler.final_state_hash().as_deref(),
        )
        .unwrap();
        assert_some_eq!(tree.get(&addr(1)).unwrap(), b"ten".to_vec());
    }

    #[test]
    fn unregistered_family_is_invalid() {
        let fix = fixture();
        let signer = PrivateKey::generate();
        fix.scheduler
            .add_batch(one_txn_batch(&signer, "unknown", 1, b"x"), None)
            .unwrap();
        fix.scheduler.finalize().unwrap();

        let executor = TransactionExecutor::new(
            fix.registry.clone(),
            fix.manager.clone(),
            ExecutorConfig::default(),
        );
        executor.execute(&fix.scheduler);
        assert!(!fix.scheduler.batch_execution_results()[0].is_valid);
    }

    #[test]
    fn internal_error_is_retried_once() {
        let fix = fixture();
        fix.registry
            .register(
                "flaky",
                "1.0",
                vec![],
                1,
                None,
                Arc::new(FlakyProcessor {
                    calls: AtomicUsize::new(0),
                }),
            )
            .unwrap();
        let signer = PrivateKey::generate();
        fix.scheduler
            .add_batch(one_txn_batch(&signer, "flaky", 2, b"x"), None)
            .unwrap();
        fix.scheduler.finalize().unwrap();

        let executor = TransactionExecutor::new(
            fix.registry.clone(),
            fix.manager.clone(),
            ExecutorConfig::default(),
        );
        executor.execute(&fix.scheduler);
        assert!(fix.scheduler.batch_execution_results()[0].is_valid);
    }

    #[test]
    fn timeout_invalidates_the_transaction() {
        let fix = fixture();
        fix.registry
            .register(
                "hang",
                "1.0",
                vec![],
                1,
                Some(Duration::from_millis(50)),
                Arc::new(HangingProcessor),
            )
            .unwrap();
        let signer = PrivateKey::generate();
        fix.scheduler
            .add_batch(one_txn_batch(&signer, "hang", 3, b"x"), None)
            .unwrap();
        fix.scheduler.finalize().unwrap();

        let executor = TransactionExecutor::new(
            fix.registry.clone(),
            fix.manager.clone(),
            ExecutorConfig::default(),
        );
        let stats = executor.execute(&fix.scheduler);
        assert!(stats.timed_out());
        assert!(!fix.scheduler.batch_execution_results()[0].is_valid);
    }
}
