// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    parse_header, BatchExecutionResult, SchedulerError, SchedulingEvent, TxnExecutionResult,
    TxnInfo, TxnStatus,
};
use parking_lot::{Condvar, Mutex};
use sawtooth_state::{ContextId, ContextManager};
use sawtooth_types::{Batch, Transaction, TransactionHeader};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, warn};

/// Releases one transaction at a time; transaction N executes over the
/// context of transaction N-1.
#[derive(Clone)]
pub struct SerialScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    context_manager: Arc<ContextManager>,
    first_state_root: String,
    always_persist: bool,
    state: Mutex<SerialState>,
    condvar: Condvar,
}

struct QueuedTxn {
    txn: Transaction,
    header: TransactionHeader,
    batch_index: usize,
}

struct BatchEntry {
    batch: Batch,
    expected_state_hash: Option<String>,
    is_valid: Option<bool>,
}

#[derive(Default)]
struct SerialState {
    queue: VecDeque<QueuedTxn>,
    batches: Vec<BatchEntry>,
    in_flight: Option<(String, usize)>,
    /// Tip of the linear context chain.
    chain_tip: Option<ContextId>,
    /// Chain tip as of the current batch's first transaction; restored if
    /// the batch fails.
    batch_start_tip: Option<ContextId>,
    batch_contexts: Vec<ContextId>,
    current_batch: Option<usize>,
    remaining_in_batch: usize,
    batch_failed: bool,
    valid_contexts: Vec<ContextId>,
    txn_results: Vec<TxnExecutionResult>,
    finalized: bool,
    cancelled: bool,
    completed: bool,
    final_state_hash: Option<String>,
}

impl SerialScheduler {
    pub fn new(
        context_manager: Arc<ContextManager>,
        first_state_root: &str,
        always_persist: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                context_manager,
                first_state_root: first_state_root.to_string(),
                always_persist,
                state: Mutex::new(SerialState::default()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn add_batch(
        &self,
        batch: Batch,
        expected_state_hash: Option<String>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return Err(SchedulerError::Cancelled);
        }
        if state.finalized {
            return Err(SchedulerError::AlreadyFinalized);
        }
        let batch_index = state.batches.len();
        let mut queued = Vec::with_capacity(batch.transactions.len());
        for txn in &batch.transactions {
            queued.push(QueuedTxn {
                header: parse_header(txn)?,
                txn: txn.clone(),
                batch_index,
            });
        }
        let empty = queued.is_empty();
        state.queue.extend(queued);
        state.batches.push(BatchEntry {
            batch,
            expected_state_hash,
            // An empty batch has nothing to execute and is trivially valid.
            is_valid: empty.then_some(true),
        });
        self.shared.condvar.notify_all();
        Ok(())
    }

    fn poll(shared: &Shared, state: &mut SerialState) -> SchedulingEvent {
        if state.cancelled || state.completed {
            return SchedulingEvent::Complete;
        }
        if state.in_flight.is_some() {
            return SchedulingEvent::WouldBlock;
        }
        let Some(queued) = state.queue.pop_front() else {
            return SchedulingEvent::WouldBlock;
        };

        if state.current_batch != Some(queued.batch_index) {
            state.current_batch = Some(queued.batch_index);
            state.batch_start_tip = state.chain_tip.clone();
            state.batch_contexts.clear();
            state.batch_failed = false;
            state.remaining_in_batch = state.batches[queued.batch_index]
                .batch
                .transactions
                .len();
        }

        state.in_flight = Some((queued.txn.id().to_string(), queued.batch_index));
        SchedulingEvent::Ready(Box::new(TxnInfo {
            base_context_ids: state.chain_tip.clone().into_iter().collect(),
            state_root: shared.first_state_root.clone(),
            txn: queued.txn,
            header: queued.header,
        }))
    }

    pub fn next_transaction(&self) -> SchedulingEvent {
        let mut state = self.shared.state.lock();
        Self::poll(&self.shared, &mut state)
    }

    pub fn next_transaction_wait(&self) -> Option<TxnInfo> {
        let mut state = self.shared.state.lock();
        loop {
            match Self::poll(&self.shared, &mut state) {
                SchedulingEvent::Ready(info) => return Some(*info),
                SchedulingEvent::Complete => return None,
                SchedulingEvent::WouldBlock => self.shared.condvar.wait(&mut state),
            }
        }
    }

    pub fn set_transaction_execution_result(
        &self,
        txn_id: &str,
        status: TxnStatus,
        context_id: Option<ContextId>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return Err(SchedulerError::Cancelled);
        }
        let Some((in_flight_id, batch_index)) = state.in_flight.clone() else {
            return Err(SchedulerError::UnexpectedResult(txn_id.to_string()));
        };
        if in_flight_id != txn_id {
            return Err(SchedulerError::UnexpectedResult(txn_id.to_string()));
        }
        state.in_flight = None;
        state.remaining_in_batch -= 1;
        let batch_id = state.batches[batch_index].batch.id().to_string();
        state.txn_results.push(TxnExecutionResult {
            transaction_id: txn_id.to_string(),
            batch_id: batch_id.clone(),
            status,
            context_id: context_id.clone(),
        });

        match status {
            TxnStatus::Valid | TxnStatus::InvalidWithoutRollback => {
                if status != TxnStatus::Valid {
                    state.batch_failed = true;
                }
                if let Some(context_id) = context_id {
                    state.chain_tip = Some(context_id.clone());
                    state.batch_contexts.push(context_id);
                }
            }
            TxnStatus::Invalid => {
                state.batch_failed = true;
                if let Some(context_id) = context_id {
                    // The rolled-back context never joins the chain.
                    self.shared.context_manager.delete_contexts(&[context_id]);
                }
                // The rest of the batch is unexecutable: batch atomicity
                // means its outcome is already decided.
                while state
                    .queue
                    .front()
                    .map(|q| q.batch_index == batch_index)
                    .unwrap_or(false)
                {
                    let skipped = state.queue.pop_front().expect("checked front");
                    state.remaining_in_batch -= 1;
                    state.txn_results.push(TxnExecutionResult {
                        transaction_id: skipped.txn.id().to_string(),
                        batch_id: batch_id.clone(),
                        status: TxnStatus::Invalid,
                        context_id: None,
                    });
                }
            }
        }

        if state.remaining_in_batch == 0 {
            self.close_batch(&mut state, batch_index);
        }
        self.try_complete(&mut state);
        self.shared.condvar.notify_all();
        Ok(())
    }

    fn close_batch(&self, state: &mut SerialState, batch_index: usize) {
        let failed = state.batch_failed;
        state.batches[batch_index].is_valid = Some(!failed);
        let batch_contexts = std::mem::take(&mut state.batch_contexts);
        if failed {
            debug!(
                batch = %state.batches[batch_index].batch.id(),
                "batch failed; rolling context chain back"
            );
            state.chain_tip = state.batch_start_tip.clone();
            self.shared.context_manager.delete_contexts(&batch_contexts);
        } else {
            state.valid_contexts.extend(batch_contexts);
        }
        state.current_batch = None;
    }

    fn try_complete(&self, state: &mut SerialState) {
        if state.completed
            || !state.finalized
            || !state.queue.is_empty()
            || state.in_flight.is_some()
            || state.batches.iter().any(|entry| entry.is_valid.is_none())
        {
            return;
        }
        match self.shared.context_manager.squash(
            &self.shared.first_state_root,
            &state.valid_contexts,
            self.shared.always_persist,
        ) {
            Ok(final_hash) => {
                if let Some(entry) = state.batches.last_mut() {
                    if let Some(expected) = &entry.expected_state_hash {
                        if *expected != final_hash {
                            warn!(
                                expected = %expected,
                                computed = %final_hash,
                                "schedule did not reproduce the expected state hash"
                            );
                            entry.is_valid = Some(false);
                        }
                    }
                }
                state.final_state_hash = Some(final_hash);
            }
            Err(err) => {
                warn!(error = %err, "final squash failed; schedule yields no state hash");
            }
        }
        state.completed = true;
    }

    pub fn finalize(&self) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return Err(SchedulerError::Cancelled);
        }
        state.finalized = true;
        self.try_complete(&mut state);
        self.shared.condvar.notify_all();
        Ok(())
    }

    pub fn complete(&self, block: bool) -> bool {
        let mut state = self.shared.state.lock();
        if block {
            while !state.completed && !state.cancelled {
                self.shared.condvar.wait(&mut state);
            }
        }
        state.completed
    }

    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        let mut contexts: Vec<ContextId> = state
            .txn_results
            .iter()
            .filter_map(|result| result.context_id.clone())
            .collect();
        contexts.extend(std::mem::take(&mut state.batch_contexts));
        self.shared.context_manager.delete_contexts(&contexts);
        self.shared.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    pub fn batch_execution_results(&self) -> Vec<BatchExecutionResult> {
        let state = self.shared.state.lock();
        let last_index = state.batches.len().saturating_sub(1);
        state
            .batches
            .iter()
            .enumerate()
            .map(|(index, entry)| BatchExecutionResult {
                batch_id: entry.batch.id().to_string(),
                is_valid: entry.is_valid.unwrap_or(false),
                state_hash: (index == last_index)
                    .then(|| state.final_state_hash.clone())
                    .flatten(),
            })
            .collect()
    }

    pub fn txn_execution_results(&self) -> Vec<TxnExecutionResult> {
        self.shared.state.lock().txn_results.clone()
    }

    pub fn final_state_hash(&self) -> Option<String> {
        self.shared.state.lock().final_state_hash.clone()
    }
}
