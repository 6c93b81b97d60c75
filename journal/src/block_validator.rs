// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Full validation of one candidate block against the state its chain is
//! built on.

use crate::{
    permission_verifier::PermissionVerifier,
    validation_rules::{enforce_validation_rules, parse_validation_rules, RuleSubject},
};
use sawtooth_chain_store::ChainStore;
use sawtooth_consensus::ConsensusEngine;
use sawtooth_executor::{ExecutorConfig, ProcessorRegistry, TransactionExecutor};
use sawtooth_scheduler::{Scheduler, SchedulerKind, TxnStatus};
use sawtooth_state::{ContextManager, SettingsView};
use sawtooth_types::{setting_keys, validation, Block, TransactionReceipt};
use serde::Deserialize;
use std::{
    collections::HashSet,
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ValidationFailure {
    /// The block is definitively invalid; so are its descendants.
    #[error("block invalid: {0}")]
    Invalid(String),
    /// The validation attempt itself failed (processor timeout, store
    /// hiccup); the verdict is unknown and the attempt may be retried.
    #[error("validation attempt failed: {0}")]
    Retryable(String),
}

/// What the candidate chain has already committed or is about to commit,
/// for duplicate and dependency checks that must not be confused by the
/// current (possibly competing) chain.
pub struct ChainCommitState {
    /// Number of the common ancestor with the committed chain, if any.
    pub ancestor_block_num: Option<u64>,
    /// Batches in candidate-chain blocks above the common ancestor.
    pub uncommitted_batch_ids: HashSet<String>,
    /// Transactions in candidate-chain blocks above the common ancestor.
    pub uncommitted_txn_ids: HashSet<String>,
}

impl ChainCommitState {
    pub fn new(ancestor_block_num: Option<u64>) -> Self {
        Self {
            ancestor_block_num,
            uncommitted_batch_ids: HashSet::new(),
            uncommitted_txn_ids: HashSet::new(),
        }
    }

    /// Folds a just-validated candidate block into the uncommitted sets.
    pub fn add_block(&mut self, block: &Block) {
        for batch in &block.batches {
            self.uncommitted_batch_ids.insert(batch.id().to_string());
            for txn_id in batch.transaction_ids() {
                self.uncommitted_txn_ids.insert(txn_id.to_string());
            }
        }
    }

    fn batch_committed(&self, store: &ChainStore, batch_id: &str) -> bool {
        if self.uncommitted_batch_ids.contains(batch_id) {
            return true;
        }
        self.in_committed_ancestry(store.get_block_by_batch_id(batch_id))
    }

    fn txn_committed(&self, store: &ChainStore, txn_id: &str) -> bool {
        if self.uncommitted_txn_ids.contains(txn_id) {
            return true;
        }
        self.in_committed_ancestry(store.get_block_by_transaction_id(txn_id))
    }

    /// Whether a store hit actually lies on the candidate's chain: only
    /// blocks at or below the common ancestor count.
    fn in_committed_ancestry(
        &self,
        lookup: Result<Option<Block>, sawtooth_chain_store::ChainStoreError>,
    ) -> bool {
        let Ok(Some(block)) = lookup else {
            return false;
        };
        let Ok(header) = block.header() else {
            return false;
        };
        match self.ancestor_block_num {
            Some(ancestor_num) => header.block_num <= ancestor_num,
            None => false,
        }
    }
}

/// Entry shape of `sawtooth.validator.transaction_families`.
#[derive(Debug, Deserialize)]
struct FamilyEntry {
    family: String,
    version: String,
}

pub struct BlockValidator {
    context_manager: Arc<ContextManager>,
    registry: Arc<ProcessorRegistry>,
    consensus: Arc<ConsensusEngine>,
    scheduler_kind: SchedulerKind,
    executor_config: ExecutorConfig,
}

impl BlockValidator {
    pub fn new(
        context_manager: Arc<ContextManager>,
        registry: Arc<ProcessorRegistry>,
        consensus: Arc<ConsensusEngine>,
        scheduler_kind: SchedulerKind,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            context_manager,
            registry,
            consensus,
            scheduler_kind,
            executor_config,
        }
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    /// Validates `block` assuming its predecessor left state at
    /// `previous_state_root`. On success the block's receipts are returned
    /// and state for its root is persisted.
    pub fn validate_block(
        &self,
        block: &Block,
        previous_state_root: &str,
        commit_state: &ChainCommitState,
        store: &ChainStore,
    ) -> Result<Vec<TransactionReceipt>, ValidationFailure> {
        // Signatures and manifest agreement.
        validation::validate_block(block)
            .map_err(|err| ValidationFailure::Invalid(err.to_string()))?;
        let header = block
            .header()
            .map_err(|err| ValidationFailure::Invalid(err.to_string()))?;

        let settings = SettingsView::new(self.context_manager.node_store(), previous_state_root)
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;

        // (a) Transactor permissions.
        for batch in &block.batches {
            if !PermissionVerifier::is_batch_allowed(&settings, batch) {
                return Err(ValidationFailure::Invalid(format!(
                    "batch {} violates transactor permissions",
                    batch.id()
                )));
            }
        }

        // (b) On-chain block validation rules and allowed families.
        self.check_on_chain_rules(block, &header.signer_public_key, &settings)?;

        // (c) Duplicates and dependencies against the candidate chain.
        self.check_duplicates_and_dependencies(block, commit_state, store)?;

        // (c, continued) Reproduce the block's execution.
        let receipts = self.execute_batches(block, &header.state_root_hash, previous_state_root)?;

        // (d) Consensus verification.
        self.consensus
            .verifier
            .verify_block(block)
            .map_err(|err| ValidationFailure::Invalid(err.to_string()))?;

        debug!(block = %block.id(), "block validated");
        Ok(receipts)
    }

    fn check_on_chain_rules(
        &self,
        block: &Block,
        block_signer: &str,
        settings: &SettingsView,
    ) -> Result<(), ValidationFailure> {
        let headers: Vec<_> = block
            .batches
            .iter()
            .flat_map(|batch| batch.transactions.iter())
            .map(|txn| txn.header())
            .collect::<Result<_, _>>()
            .map_err(|err| ValidationFailure::Invalid(err.to_string()))?;

        if let Some(rules) = settings
            .get_setting(setting_keys::BLOCK_VALIDATION_RULES)
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?
        {
            let subjects: Vec<RuleSubject<'_>> = headers
                .iter()
                .map(|header| RuleSubject {
                    family_name: &header.family_name,
                    signer_public_key: &header.signer_public_key,
                })
                .collect();
            enforce_validation_rules(&parse_validation_rules(&rules), block_signer, &subjects)
                .map_err(ValidationFailure::Invalid)?;
        }

        if let Some(families) = settings
            .get_setting(setting_keys::TRANSACTION_FAMILIES)
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?
        {
            let allowed: Vec<FamilyEntry> = serde_json::from_str(&families).map_err(|err| {
                warn!(error = %err, "unparseable transaction_families setting");
                ValidationFailure::Invalid("malformed transaction_families setting".to_string())
            })?;
            for header in &headers {
                let permitted = allowed.iter().any(|entry| {
                    entry.family == header.family_name && entry.version == header.family_version
                });
                if !permitted {
                    return Err(ValidationFailure::Invalid(format!(
                        "transaction family {} {} not allowed on this chain",
                        header.family_name, header.family_version
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_duplicates_and_dependencies(
        &self,
        block: &Block,
        commit_state: &ChainCommitState,
        store: &ChainStore,
    ) -> Result<(), ValidationFailure> {
        let mut seen_batches = HashSet::new();
        let mut seen_txns: HashSet<String> = HashSet::new();
        for batch in &block.batches {
            if !seen_batches.insert(batch.id().to_string())
                || commit_state.batch_committed(store, batch.id())
            {
                return Err(ValidationFailure::Invalid(format!(
                    "duplicate batch {}",
                    batch.id()
                )));
            }
            for txn in &batch.transactions {
                if !seen_txns.insert(txn.id().to_string())
                    || commit_state.txn_committed(store, txn.id())
                {
                    return Err(ValidationFailure::Invalid(format!(
                        "duplicate transaction {}",
                        txn.id()
                    )));
                }
                let txn_header = txn
                    .header()
                    .map_err(|err| ValidationFailure::Invalid(err.to_string()))?;
                for dependency in &txn_header.dependencies {
                    let satisfied = seen_txns.contains(dependency)
                        || commit_state.txn_committed(store, dependency);
                    if !satisfied {
                        return Err(ValidationFailure::Invalid(format!(
                            "transaction {} depends on missing {dependency}",
                            txn.id()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn execute_batches(
        &self,
        block: &Block,
        expected_state_root: &str,
        previous_state_root: &str,
    ) -> Result<Vec<TransactionReceipt>, ValidationFailure> {
        let scheduler = Scheduler::new(
            self.scheduler_kind,
            self.context_manager.clone(),
            previous_state_root,
            true,
        );
        let batch_count = block.batches.len();
        for (index, batch) in block.batches.iter().enumerate() {
            let expected = (index + 1 == batch_count).then(|| expected_state_root.to_string());
            scheduler
                .add_batch(batch.clone(), expected)
                .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
        }
        scheduler
            .finalize()
            .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;

        let executor = TransactionExecutor::new(
            self.registry.clone(),
            self.context_manager.clone(),
            self.executor_config.clone(),
        );
        let stats = executor.execute(&scheduler);
        let outcome = self.collect_outcome(&scheduler, expected_state_root, &stats);
        scheduler.cancel();
        outcome
    }

    fn collect_outcome(
        &self,
        scheduler: &Scheduler,
        expected_state_root: &str,
        stats: &sawtooth_executor::ExecutionStats,
    ) -> Result<Vec<TransactionReceipt>, ValidationFailure> {
        if stats.timed_out() {
            // A timeout is not a deterministic verdict; fail the attempt,
            // not the block.
            return Err(ValidationFailure::Retryable(
                "processor timeout during validation".to_string(),
            ));
        }
        if !scheduler.complete(true) {
            return Err(ValidationFailure::Retryable(
                "schedule did not complete".to_string(),
            ));
        }
        for result in scheduler.batch_execution_results() {
            if !result.is_valid {
                return Err(ValidationFailure::Invalid(format!(
                    "batch {} failed execution",
                    result.batch_id
                )));
            }
        }
        // (e) Computed state root must equal the header's.
        match scheduler.final_state_hash() {
            Some(computed) if computed == expected_state_root => {}
            computed => {
                return Err(ValidationFailure::Invalid(format!(
                    "state root mismatch: computed {computed:?}, header {expected_state_root}"
                )));
            }
        }

        let mut receipts = Vec::new();
        for result in scheduler.txn_execution_results() {
            if result.status != TxnStatus::Valid {
                continue;
            }
            let Some(context_id) = result.context_id else {
                continue;
            };
            let (state_changes, events, data) = self
                .context_manager
                .execution_results(&context_id)
                .map_err(|err| ValidationFailure::Retryable(err.to_string()))?;
            receipts.push(TransactionReceipt {
                transaction_id: result.transaction_id,
                state_changes,
                events,
                data,
            });
        }
        Ok(receipts)
    }
}
