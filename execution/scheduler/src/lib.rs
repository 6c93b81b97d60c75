// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transaction scheduling: ordering transactions for execution while
//! honoring batch atomicity and declared read/write sets.
//!
//! Two interchangeable implementations sit behind the [`Scheduler`] enum.
//! The serial scheduler releases one transaction at a time along a linear
//! context chain. The parallel scheduler derives a partial order from a
//! predecessor tree over declared address prefixes and releases every
//! transaction whose predecessors have completed.
//!
//! Both produce the same final state root for the same batch list, base
//! root, and execution results.

mod parallel;
mod predecessor_tree;
mod serial;

pub use parallel::ParallelScheduler;
pub use predecessor_tree::PredecessorTree;
pub use serial::SerialScheduler;

use sawtooth_state::{ContextId, ContextManager, StateError};
use sawtooth_types::{Batch, Transaction, TransactionHeader};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule is finalized; no more batches may be added")]
    AlreadyFinalized,
    #[error("schedule was cancelled")]
    Cancelled,
    #[error("no in-flight transaction {0}")]
    UnexpectedResult(String),
    #[error("transaction {0} has an unparseable header")]
    BadTransaction(String),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Outcome of executing one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Valid,
    Invalid,
    /// The transaction failed but its observed writes are left in the
    /// context chain for the remainder of its batch. The batch is still
    /// reported invalid as a whole.
    InvalidWithoutRollback,
}

impl TxnStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, TxnStatus::Valid)
    }
}

/// A transaction released for execution.
#[derive(Clone, Debug)]
pub struct TxnInfo {
    pub txn: Transaction,
    pub header: TransactionHeader,
    /// Context ids this execution reads through, oldest first.
    pub base_context_ids: Vec<ContextId>,
    /// The state root contexts for this schedule are rooted at.
    pub state_root: String,
}

/// What `next_transaction` has to offer right now.
#[derive(Clone, Debug)]
pub enum SchedulingEvent {
    /// A transaction is ready.
    Ready(Box<TxnInfo>),
    /// Nothing ready until more results land.
    WouldBlock,
    /// Every transaction has been released and resolved; no more will come.
    Complete,
}

/// Per-transaction outcome, exposed after completion.
#[derive(Clone, Debug)]
pub struct TxnExecutionResult {
    pub transaction_id: String,
    pub batch_id: String,
    pub status: TxnStatus,
    pub context_id: Option<ContextId>,
}

/// Per-batch outcome, exposed after completion.
#[derive(Clone, Debug)]
pub struct BatchExecutionResult {
    pub batch_id: String,
    pub is_valid: bool,
    /// The cumulative state root after this batch; only computed for the
    /// final batch of the schedule.
    pub state_hash: Option<String>,
}

/// The two scheduler implementations behind one contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
    Serial,
    Parallel,
}

#[derive(Clone)]
pub enum Scheduler {
    Serial(SerialScheduler),
    Parallel(ParallelScheduler),
}

impl Scheduler {
    /// A new schedule over `first_state_root`. When `always_persist` is
    /// set the final squash writes its nodes to the backing store;
    /// otherwise the final root is computed against a scratch overlay.
    pub fn new(
        kind: SchedulerKind,
        context_manager: Arc<ContextManager>,
        first_state_root: &str,
        always_persist: bool,
    ) -> Self {
        match kind {
            SchedulerKind::Serial => Scheduler::Serial(SerialScheduler::new(
                context_manager,
                first_state_root,
                always_persist,
            )),
            SchedulerKind::Parallel => Scheduler::Parallel(ParallelScheduler::new(
                context_manager,
                first_state_root,
                always_persist,
            )),
        }
    }

    pub fn add_batch(
        &self,
        batch: Batch,
        expected_state_hash: Option<String>,
    ) -> Result<(), SchedulerError> {
        match self {
            Scheduler::Serial(s) => s.add_batch(batch, expected_state_hash),
            Scheduler::Parallel(s) => s.add_batch(batch, expected_state_hash),
        }
    }

    pub fn next_transaction(&self) -> SchedulingEvent {
        match self {
            Scheduler::Serial(s) => s.next_transaction(),
            Scheduler::Parallel(s) => s.next_transaction(),
        }
    }

    /// Blocks until a transaction is ready or the schedule completes.
    pub fn next_transaction_wait(&self) -> Option<TxnInfo> {
        match self {
            Scheduler::Serial(s) => s.next_transaction_wait(),
            Scheduler::Parallel(s) => s.next_transaction_wait(),
        }
    }

    pub fn set_transaction_execution_result(
        &self,
        txn_id: &str,
        status: TxnStatus,
        context_id: Option<ContextId>,
    ) -> Result<(), SchedulerError> {
        match self {
            Scheduler::Serial(s) => s.set_transaction_execution_result(txn_id, status, context_id),
            Scheduler::Parallel(s) => {
                s.set_transaction_execution_result(txn_id, status, context_id)
            }
        }
    }

    pub fn finalize(&self) -> Result<(), SchedulerError> {
        match self {
            Scheduler::Serial(s) => s.finalize(),
            Scheduler::Parallel(s) => s.finalize(),
        }
    }

    /// Whether the schedule is complete; with `block` set, waits for it.
    pub fn complete(&self, block: bool) -> bool {
        match self {
            Scheduler::Serial(s) => s.complete(block),
            Scheduler::Parallel(s) => s.complete(block),
        }
    }

    pub fn cancel(&self) {
        match self {
            Scheduler::Serial(s) => s.cancel(),
            Scheduler::Parallel(s) => s.cancel(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Scheduler::Serial(s) => s.is_cancelled(),
            Scheduler::Parallel(s) => s.is_cancelled(),
        }
    }

    /// Batch results in submission order; available once complete.
    pub fn batch_execution_results(&self) -> Vec<BatchExecutionResult> {
        match self {
            Scheduler::Serial(s) => s.batch_execution_results(),
            Scheduler::Parallel(s) => s.batch_execution_results(),
        }
    }

    /// Transaction results in schedule order; available once complete.
    pub fn txn_execution_results(&self) -> Vec<TxnExecutionResult> {
        match self {
            Scheduler::Serial(s) => s.txn_execution_results(),
            Scheduler::Parallel(s) => s.txn_execution_results(),
        }
    }

    /// The deterministic final root; `Some` once the schedule completed
    /// with at least the empty squash done.
    pub fn final_state_hash(&self) -> Option<String> {
        match self {
            Scheduler::Serial(s) => s.final_state_hash(),
            Scheduler::Parallel(s) => s.final_state_hash(),
        }
    }
}

pub(crate) fn parse_header(txn: &Transaction) -> Result<TransactionHeader, SchedulerError> {
    txn.header()
        .map_err(|_| SchedulerError::BadTransaction(txn.id().to_string()))
}
