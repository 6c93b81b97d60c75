// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    parse_header, predecessor_tree::PredecessorTree, BatchExecutionResult, SchedulerError,
    SchedulingEvent, TxnExecutionResult, TxnInfo, TxnStatus,
};
use parking_lot::{Condvar, Mutex};
use sawtooth_state::{ContextId, ContextManager};
use sawtooth_types::{prefixes_overlap, Batch, Transaction, TransactionHeader};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, warn};

/// Releases every transaction whose predecessors have completed.
///
/// Predecessors of a transaction are every prior writer overlapping any of
/// its inputs or outputs, and every prior reader overlapping any of its
/// outputs. A transaction additionally waits for foreign batches containing
/// its predecessors to resolve, so that it only ever observes writes that
/// will actually be applied; this is what keeps the parallel schedule
/// result-equivalent to the serial one.
#[derive(Clone)]
pub struct ParallelScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    context_manager: Arc<ContextManager>,
    first_state_root: String,
    always_persist: bool,
    state: Mutex<ParallelState>,
    condvar: Condvar,
}

struct TxnEntry {
    txn: Transaction,
    header: TransactionHeader,
    batch_index: usize,
    /// Direct predecessors, in insertion order.
    predecessors: Vec<String>,
    scheduled: bool,
    result: Option<(TxnStatus, Option<ContextId>)>,
}

struct BatchEntry {
    batch: Batch,
    expected_state_hash: Option<String>,
    remaining: usize,
    failed: bool,
    is_valid: Option<bool>,
}

#[derive(Default)]
struct ParallelState {
    txn_order: Vec<String>,
    txns: HashMap<String, TxnEntry>,
    batches: Vec<BatchEntry>,
    tree: PredecessorTree,
    txn_results: Vec<TxnExecutionResult>,
    finalized: bool,
    cancelled: bool,
    completed: bool,
    final_state_hash: Option<String>,
}

impl ParallelScheduler {
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
                state: Mutex::new(ParallelState::default()),
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
        let txn_count = batch.transactions.len();

        for txn in &batch.transactions {
            let header = parse_header(txn)?;
            let txn_id = txn.id().to_string();

            let mut seen: HashSet<String> = HashSet::new();
            let mut predecessors: Vec<String> = Vec::new();
            let mut note = |candidates: Vec<String>| {
                for candidate in candidates {
                    if candidate != txn_id && seen.insert(candidate.clone()) {
                        predecessors.push(candidate);
                    }
                }
            };
            for input in &header.inputs {
                note(state.tree.find_overlapping_writers(input));
            }
            for output in &header.outputs {
                note(state.tree.find_overlapping_writers(output));
                note(state.tree.find_overlapping_readers(output));
            }
            // Keep predecessor order aligned with insertion order.
            let order_of: HashMap<&str, usize> = state
                .txn_order
                .iter()
                .enumerate()
                .map(|(index, id)| (id.as_str(), index))
                .collect();
            predecessors.sort_by_key(|id| order_of.get(id.as_str()).copied());

            for input in &header.inputs {
                state.tree.add_reader(input, &txn_id);
            }
            for output in &header.outputs {
                state.tree.add_writer(output, &txn_id);
            }

            state.txn_order.push(txn_id.clone());
            state.txns.insert(
                txn_id,
                TxnEntry {
                    txn: txn.clone(),
                    header,
                    batch_index,
                    predecessors,
                    scheduled: false,
                    result: None,
                },
            );
        }

        state.batches.push(BatchEntry {
            batch,
            expected_state_hash,
            remaining: txn_count,
            failed: false,
            is_valid: (txn_count == 0).then_some(true),
        });
        self.shared.condvar.notify_all();
        Ok(())
    }

    /// Whether `txn` may be released, and with which base contexts. Returns
    /// `Err(())` for "not yet".
    fn readiness(
        state: &ParallelState,
        txn_id: &str,
    ) -> Result<ReadyDecision, ()> {
        let entry = &state.txns[txn_id];
        let mut base_contexts = Vec::new();
        for pred_id in &entry.predecessors {
            let pred = &state.txns[pred_id];
            let Some((status, context_id)) = &pred.result else {
                return Err(());
            };
            if pred.batch_index == entry.batch_index {
                match status {
                    TxnStatus::Valid | TxnStatus::InvalidWithoutRollback => {
                        if let Some(context_id) = context_id {
                            base_contexts.push(context_id.clone());
                        }
                    }
                    TxnStatus::Invalid => {
                        // Output dependency on a rolled-back sibling:
                        // this transaction can never see the state it
                        // declared it would read.
                        let depends_via_output = entry
                            .header
                            .inputs
                            .iter()
                            .chain(entry.header.outputs.iter())
                            .any(|declared| {
                                pred.header
                                    .outputs
                                    .iter()
                                    .any(|output| prefixes_overlap(declared, output))
                            });
                        if depends_via_output {
                            return Ok(ReadyDecision::AutoInvalid);
                        }
                    }
                }
            } else {
                // Cross-batch: wait until the foreign batch resolves, then
                // chain its contexts only if the whole batch stands.
                match state.batches[pred.batch_index].is_valid {
                    None => return Err(()),
                    Some(true) => {
                        if let Some(context_id) = context_id {
                            base_contexts.push(context_id.clone());
                        }
                    }
                    Some(false) => {}
                }
            }
        }
        Ok(ReadyDecision::Release(base_contexts))
    }

    fn poll(&self, state: &mut ParallelState) -> SchedulingEvent {
        if state.cancelled || state.completed {
            return SchedulingEvent::Complete;
        }
        loop {
            let mut progressed = false;
            for index in 0..state.txn_order.len() {
                let txn_id = state.txn_order[index].clone();
                if state.txns[&txn_id].scheduled {
                    continue;
                }
                match Self::readiness(state, &txn_id) {
                    Err(()) => continue,
                    Ok(ReadyDecision::AutoInvalid) => {
                        self.record_result(state, &txn_id, TxnStatus::Invalid, None);
                        progressed = true;
                        // Re-scan: the auto-failure may resolve a batch and
                        // unblock or fail others.
                        break;
                    }
                    Ok(ReadyDecision::Release(base_context_ids)) => {
                        let entry = state.txns.get_mut(&txn_id).expect("known txn");
                        entry.scheduled = true;
                        return SchedulingEvent::Ready(Box::new(TxnInfo {
                            txn: entry.txn.clone(),
                            header: entry.header.clone(),
                            base_context_ids,
                            state_root: self.shared.first_state_root.clone(),
                        }));
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        self.try_complete(state);
        if state.completed {
            SchedulingEvent::Complete
        } else {
            SchedulingEvent::WouldBlock
        }
    }

    pub fn next_transaction(&self) -> SchedulingEvent {
        let mut state = self.shared.state.lock();
        self.poll(&mut state)
    }

    pub fn next_transaction_wait(&self) -> Option<TxnInfo> {
        let mut state = self.shared.state.lock();
        loop {
            match self.poll(&mut state) {
                SchedulingEvent::Ready(info) => return Some(*info),
                SchedulingEvent::Complete => return None,
                SchedulingEvent::WouldBlock => self.shared.condvar.wait(&mut state),
            }
        }
    }

    fn record_result(
        &self,
        state: &mut ParallelState,
        txn_id: &str,
        status: TxnStatus,
        context_id: Option<ContextId>,
    ) {
        let entry = state.txns.get_mut(txn_id).expect("known txn");
        entry.scheduled = true;
        entry.result = Some((status, context_id.clone()));
        let batch_index = entry.batch_index;

        let batch = &mut state.batches[batch_index];
        batch.remaining -= 1;
        if !status.is_valid() {
            batch.failed = true;
        }
        state.txn_results.push(TxnExecutionResult {
            transaction_id: txn_id.to_string(),
            batch_id: batch.batch.id().to_string(),
            status,
            context_id: context_id.clone(),
        });
        if status == TxnStatus::Invalid {
            if let Some(context_id) = context_id {
                self.shared.context_manager.delete_contexts(&[context_id]);
            }
        }

        if state.batches[batch_index].remaining == 0 {
            let failed = state.batches[batch_index].failed;
            state.batches[batch_index].is_valid = Some(!failed);
            if failed {
                debug!(
                    batch = %state.batches[batch_index].batch.id(),
                    "batch failed; discarding its contexts"
                );
                let contexts: Vec<ContextId> = state
                    .txns
                    .values()
                    .filter(|t| t.batch_index == batch_index)
                    .filter_map(|t| t.result.as_ref().and_then(|(_, ctx)| ctx.clone()))
                    .collect();
                self.shared.context_manager.delete_contexts(&contexts);
                for entry in state
                    .txns
                    .values_mut()
                    .filter(|t| t.batch_index == batch_index)
                {
                    if let Some((_, ctx)) = &mut entry.result {
                        *ctx = None;
                    }
                }
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
        let valid_target = state
            .txns
            .get(txn_id)
            .map(|entry| entry.scheduled && entry.result.is_none())
            .unwrap_or(false);
        if !valid_target {
            return Err(SchedulerError::UnexpectedResult(txn_id.to_string()));
        }
        self.record_result(&mut state, txn_id, status, context_id);
        self.try_complete(&mut state);
        self.shared.condvar.notify_all();
        Ok(())
    }

    fn try_complete(&self, state: &mut ParallelState) {
        if state.completed
            || !state.finalized
            || state.batches.iter().any(|batch| batch.is_valid.is_none())
            || state
                .txn_order
                .iter()
                .any(|id| state.txns[id].result.is_none())
        {
            return;
        }
        let contexts: Vec<ContextId> = state
            .txn_order
            .iter()
            .filter_map(|id| {
                let entry = &state.txns[id];
                if state.batches[entry.batch_index].is_valid == Some(true) {
                    entry.result.as_ref().and_then(|(_, ctx)| ctx.clone())
                } else {
                    None
                }
            })
            .collect();
        match self.shared.context_manager.squash(
            &self.shared.first_state_root,
            &contexts,
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
        let contexts: Vec<ContextId> = state
            .txns
            .values()
            .filter_map(|entry| entry.result.as_ref().and_then(|(_, ctx)| ctx.clone()))
            .collect();
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

enum ReadyDecision {
    Release(Vec<ContextId>),
    AutoInvalid,
}
