// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! One-shot production of the first block.
//!
//! When a `genesis.batch` file is present and no chain head exists, the
//! batches it carries are executed in file order through the serial
//! scheduler with no reordering; any failure is fatal. The resulting block
//! has number 0, the reserved previous id, empty consensus bytes, and its
//! signature becomes the contents of `block-chain-id`.

use sawtooth_chain_store::{ChainStore, ChainStoreError};
use sawtooth_executor::{ExecutorConfig, ProcessorRegistry, TransactionExecutor};
use sawtooth_scheduler::{Scheduler, SchedulerKind};
use sawtooth_state::ContextManager;
use sawtooth_types::{Batch, Block, BlockBuilder, NULL_BLOCK_IDENTIFIER};
use sawtooth_crypto::PrivateKey;
use sawtooth_merkle::MerkleRadixTree;
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tracing::info;

pub const GENESIS_FILE: &str = "genesis.batch";

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("genesis file unreadable: {0}")]
    UnreadableFile(String),
    #[error("genesis batch {0} failed execution")]
    BatchFailed(String),
    #[error("genesis produced no state hash")]
    NoStateHash,
    #[error(transparent)]
    ChainStore(#[from] ChainStoreError),
    #[error("genesis failure: {0}")]
    Other(String),
}

/// On-disk shape of `genesis.batch`.
#[derive(Serialize, Deserialize)]
struct GenesisData {
    batches: Vec<Batch>,
}

/// Serializes batches into a `genesis.batch` payload; used by tooling and
/// tests.
pub fn genesis_file_bytes(batches: &[Batch]) -> Result<Vec<u8>, GenesisError> {
    bcs::to_bytes(&GenesisData {
        batches: batches.to_vec(),
    })
    .map_err(|err| GenesisError::Other(err.to_string()))
}

/// Loads the batches from a `genesis.batch` file.
pub fn load_genesis_batches(path: &Path) -> Result<Vec<Batch>, GenesisError> {
    let bytes =
        std::fs::read(path).map_err(|err| GenesisError::UnreadableFile(err.to_string()))?;
    let data: GenesisData =
        bcs::from_bytes(&bytes).map_err(|err| GenesisError::UnreadableFile(err.to_string()))?;
    Ok(data.batches)
}

pub struct GenesisController {
    store: Arc<ChainStore>,
    context_manager: Arc<ContextManager>,
    registry: Arc<ProcessorRegistry>,
    signer: PrivateKey,
    executor_config: ExecutorConfig,
}

impl GenesisController {
    pub fn new(
        store: Arc<ChainStore>,
        context_manager: Arc<ContextManager>,
        registry: Arc<ProcessorRegistry>,
        signer: PrivateKey,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            context_manager,
            registry,
            signer,
            executor_config,
        }
    }

    /// The genesis path runs only when the file exists and nothing has
    /// been committed yet.
    pub fn requires_genesis(&self) -> Result<bool, GenesisError> {
        let file_present = self.store.data_dir().join(GENESIS_FILE).exists();
        let head_missing = self.store.chain_head_id()?.is_none();
        let chain_id_missing = self.store.chain_id()?.is_none();
        Ok(file_present && head_missing && chain_id_missing)
    }

    /// Produces and commits the genesis block. Every failure is fatal to
    /// the caller; there is no partial genesis.
    pub fn run(&self) -> Result<Block, GenesisError> {
        let path = self.store.data_dir().join(GENESIS_FILE);
        let batches = load_genesis_batches(&path)?;
        info!(batches = batches.len(), "starting genesis block production");

        // A fresh chain starts from a freshly-written empty tree.
        let node_store = self.context_manager.node_store();
        let empty_root = MerkleRadixTree::new(node_store, None)
            .map_err(|err| GenesisError::Other(err.to_string()))?
            .root_hash()
            .to_string();

        // Serial, in file order, no drops: exactly what the file says.
        let scheduler = Scheduler::new(
            SchedulerKind::Serial,
            self.context_manager.clone(),
            &empty_root,
            true,
        );
        for batch in &batches {
            scheduler
                .add_batch(batch.clone(), None)
                .map_err(|err| GenesisError::Other(err.to_string()))?;
        }
        scheduler
            .finalize()
            .map_err(|err| GenesisError::Other(err.to_string()))?;

        let executor = TransactionExecutor::new(
            self.registry.clone(),
            self.context_manager.clone(),
            self.executor_config.clone(),
        );
        executor.execute(&scheduler);
        scheduler.complete(true);

        for result in scheduler.batch_execution_results() {
            if !result.is_valid {
                return Err(GenesisError::BatchFailed(result.batch_id));
            }
        }
        let state_root = scheduler
            .final_state_hash()
            .ok_or(GenesisError::NoStateHash)?;
        scheduler.cancel();

        let block = BlockBuilder::new(0, NULL_BLOCK_IDENTIFIER)
            .state_root_hash(state_root)
            .batches(batches)
            .build(&self.signer)
            .map_err(|err| GenesisError::Other(err.to_string()))?;

        self.store.put_chain_head(&[block.clone()], &[], &[])?;
        self.store.set_chain_id(block.id())?;
        info!(block = %block.id(), "genesis block committed");
        Ok(block)
    }
}
