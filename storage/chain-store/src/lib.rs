// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable chain storage: the committed block chain with its secondary
//! indexes, transaction receipts, the merkle node column family, and the
//! `block-chain-id` marker file.
//!
//! The stored chain is always a strict parent-linked path from the chain
//! head back to genesis. Head movement (including fork switches) is applied
//! as one atomic write batch; a crash can never leave the indexes and the
//! primary chain disagreeing.

pub mod schemas;

use schemas::{
    BlockByBatchSchema, BlockByTxnSchema, BlockNumSchema, BlockSchema, ChainHeadSchema,
    MerkleNodeSchema, ReceiptSchema, COLUMN_FAMILIES,
};
use sawtooth_merkle::{MerkleError, MerkleNodeStore};
use sawtooth_schemadb::{SchemaBatch, StoreError, DB};
use sawtooth_types::{Block, ProtocolError, TransactionReceipt, NULL_BLOCK_IDENTIFIER};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, warn};

const CHAIN_DB_NAME: &str = "chain";
const BLOCK_CHAIN_ID_FILE: &str = "block-chain-id";

#[derive(Debug, Error)]
pub enum ChainStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("chain store corruption: {0}")]
    Corruption(String),
    #[error("head update rejected: {0}")]
    HeadMoved(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The chain database plus the data-directory files that travel with it.
pub struct ChainStore {
    db: Arc<DB>,
    data_dir: PathBuf,
}

impl ChainStore {
    /// Opens (or creates) the chain database under `data_dir` and verifies
    /// integrity of whatever chain it holds.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, ChainStoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        let db = Arc::new(DB::open(
            data_dir.join("chain-db"),
            CHAIN_DB_NAME,
            COLUMN_FAMILIES,
        )?);
        let store = Self { db, data_dir };
        store.check_integrity()?;
        Ok(store)
    }

    /// A merkle node store sharing this database.
    pub fn node_store(&self) -> OnDiskNodeStore {
        OnDiskNodeStore {
            db: self.db.clone(),
        }
    }

    pub fn chain_head_id(&self) -> Result<Option<String>, ChainStoreError> {
        Ok(self.db.get::<ChainHeadSchema>(&())?)
    }

    pub fn chain_head(&self) -> Result<Option<Block>, ChainStoreError> {
        match self.chain_head_id()? {
            Some(id) => self.get_block(&id),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, block_id: &str) -> Result<Option<Block>, ChainStoreError> {
        Ok(self.db.get::<BlockSchema>(&block_id.to_string())?)
    }

    pub fn get_block_by_number(&self, block_num: u64) -> Result<Option<Block>, ChainStoreError> {
        match self.db.get::<BlockNumSchema>(&block_num)? {
            Some(id) => self.get_block(&id),
            None => Ok(None),
        }
    }

    pub fn get_block_by_batch_id(&self, batch_id: &str) -> Result<Option<Block>, ChainStoreError> {
        match self.db.get::<BlockByBatchSchema>(&batch_id.to_string())? {
            Some(id) => self.get_block(&id),
            None => Ok(None),
        }
    }

    pub fn get_block_by_transaction_id(
        &self,
        txn_id: &str,
    ) -> Result<Option<Block>, ChainStoreError> {
        match self.db.get::<BlockByTxnSchema>(&txn_id.to_string())? {
            Some(id) => self.get_block(&id),
            None => Ok(None),
        }
    }

    pub fn get_batch(
        &self,
        batch_id: &str,
    ) -> Result<Option<sawtooth_types::Batch>, ChainStoreError> {
        Ok(self.get_block_by_batch_id(batch_id)?.and_then(|block| {
            block
                .batches
                .into_iter()
                .find(|batch| batch.id() == batch_id)
        }))
    }

    pub fn get_batch_by_transaction_id(
        &self,
        txn_id: &str,
    ) -> Result<Option<sawtooth_types::Batch>, ChainStoreError> {
        Ok(self.get_block_by_transaction_id(txn_id)?.and_then(|block| {
            block
                .batches
                .into_iter()
                .find(|batch| batch.transaction_ids().any(|id| id == txn_id))
        }))
    }

    pub fn has_block(&self, block_id: &str) -> Result<bool, ChainStoreError> {
        Ok(self.get_block(block_id)?.is_some())
    }

    pub fn has_batch(&self, batch_id: &str) -> Result<bool, ChainStoreError> {
        Ok(self
            .db
            .get::<BlockByBatchSchema>(&batch_id.to_string())?
            .is_some())
    }

    pub fn has_transaction(&self, txn_id: &str) -> Result<bool, ChainStoreError> {
        Ok(self
            .db
            .get::<BlockByTxnSchema>(&txn_id.to_string())?
            .is_some())
    }

    pub fn get_receipt(
        &self,
        txn_id: &str,
    ) -> Result<Option<TransactionReceipt>, ChainStoreError> {
        Ok(self.db.get::<ReceiptSchema>(&txn_id.to_string())?)
    }

    /// Moves the chain head: removes `decommit` (ordered from the current
    /// head backwards), adds `commit` (ordered by ascending block number),
    /// and stores `receipts` for the committed transactions — all in one
    /// atomic batch.
    ///
    /// The decommit/commit pair must splice: the decommitted blocks must be
    /// the current tip, and the first committed block must extend what
    /// remains. Anything else means two head updates raced, which the
    /// journal serializes against; it is surfaced as a fatal error.
    pub fn put_chain_head(
        &self,
        commit: &[Block],
        decommit: &[Block],
        receipts: &[TransactionReceipt],
    ) -> Result<(), ChainStoreError> {
        let first_commit = commit.first().ok_or_else(|| {
            ChainStoreError::HeadMoved("commit set must not be empty".to_string())
        })?;
        let first_header = first_commit.header()?;

        let current_head = self.chain_head_id()?;
        let expected_after_decommit = match decommit.first() {
            Some(tip) => {
                if current_head.as_deref() != Some(tip.id()) {
                    return Err(ChainStoreError::HeadMoved(format!(
                        "decommit tip {} is not the chain head {:?}",
                        tip.id(),
                        current_head
                    )));
                }
                decommit.last().expect("non-empty").header()?.previous_block_id
            }
            None => current_head.clone().unwrap_or_else(|| NULL_BLOCK_IDENTIFIER.to_string()),
        };
        if first_header.previous_block_id != expected_after_decommit {
            return Err(ChainStoreError::HeadMoved(format!(
                "block {} does not extend {}",
                first_commit.id(),
                expected_after_decommit
            )));
        }

        let batch = SchemaBatch::new();
        for block in decommit {
            let header = block.header()?;
            batch.delete::<BlockSchema>(&block.id().to_string())?;
            batch.delete::<BlockNumSchema>(&header.block_num)?;
            for contained in &block.batches {
                batch.delete::<BlockByBatchSchema>(&contained.id().to_string())?;
                for txn_id in contained.transaction_ids() {
                    batch.delete::<BlockByTxnSchema>(&txn_id.to_string())?;
                    batch.delete::<ReceiptSchema>(&txn_id.to_string())?;
                }
            }
        }
        for block in commit {
            let header = block.header()?;
            let id = block.id().to_string();
            batch.put::<BlockSchema>(&id, block)?;
            batch.put::<BlockNumSchema>(&header.block_num, &id)?;
            for contained in &block.batches {
                batch.put::<BlockByBatchSchema>(&contained.id().to_string(), &id)?;
                for txn_id in contained.transaction_ids() {
                    batch.put::<BlockByTxnSchema>(&txn_id.to_string(), &id)?;
                }
            }
        }
        for receipt in receipts {
            batch.put::<ReceiptSchema>(&receipt.transaction_id, receipt)?;
        }
        let new_head = commit.last().expect("non-empty").id().to_string();
        batch.put::<ChainHeadSchema>(&(), &new_head)?;

        self.db.write_schemas(batch)?;
        info!(
            head = %new_head,
            committed = commit.len(),
            decommitted = decommit.len(),
            "chain head updated"
        );
        Ok(())
    }

    /// Walks the whole committed chain head→genesis, checking parent links,
    /// block numbers, and secondary-index agreement.
    pub fn check_integrity(&self) -> Result<(), ChainStoreError> {
        let Some(head_id) = self.chain_head_id()? else {
            return Ok(());
        };
        let mut cursor = head_id.clone();
        let mut expected_num: Option<u64> = None;
        loop {
            let block = self.get_block(&cursor)?.ok_or_else(|| {
                ChainStoreError::Corruption(format!("chain references missing block {cursor}"))
            })?;
            let header = block.header()?;
            if let Some(expected) = expected_num {
                if header.block_num != expected {
                    return Err(ChainStoreError::Corruption(format!(
                        "block {} has number {}, expected {}",
                        cursor, header.block_num, expected
                    )));
                }
            }
            if self.db.get::<BlockNumSchema>(&header.block_num)?.as_deref() != Some(&cursor) {
                return Err(ChainStoreError::Corruption(format!(
                    "height index disagrees at block {cursor}"
                )));
            }
            for contained in &block.batches {
                if self
                    .db
                    .get::<BlockByBatchSchema>(&contained.id().to_string())?
                    .as_deref()
                    != Some(&cursor)
                {
                    return Err(ChainStoreError::Corruption(format!(
                        "batch index disagrees for {} in block {cursor}",
                        contained.id()
                    )));
                }
            }
            if header.is_genesis() {
                if header.block_num != 0 {
                    return Err(ChainStoreError::Corruption(
                        "genesis block is not number 0".to_string(),
                    ));
                }
                break;
            }
            expected_num = Some(header.block_num.wrapping_sub(1));
            cursor = header.previous_block_id;
        }
        Ok(())
    }

    /// The committed chain from the head backwards, newest first.
    pub fn chain_iter(&self) -> ChainIter<'_> {
        ChainIter {
            store: self,
            cursor: None,
            started: false,
        }
    }

    /// Reads the `block-chain-id` marker, if written.
    pub fn chain_id(&self) -> Result<Option<String>, ChainStoreError> {
        let path = self.data_dir.join(BLOCK_CHAIN_ID_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the `block-chain-id` marker; done exactly once, at genesis.
    pub fn set_chain_id(&self, chain_id: &str) -> Result<(), ChainStoreError> {
        let path = self.data_dir.join(BLOCK_CHAIN_ID_FILE);
        if path.exists() {
            warn!("block-chain-id already present, refusing to overwrite");
            return Err(ChainStoreError::Corruption(
                "block-chain-id already written".to_string(),
            ));
        }
        std::fs::write(path, chain_id)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Iterator over committed blocks, chain head first.
pub struct ChainIter<'a> {
    store: &'a ChainStore,
    cursor: Option<String>,
    started: bool,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<Block, ChainStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.cursor = match self.store.chain_head_id() {
                Ok(id) => id,
                Err(err) => return Some(Err(err)),
            };
        }
        let id = self.cursor.take()?;
        match self.store.get_block(&id) {
            Ok(Some(block)) => {
                match block.header() {
                    Ok(header) if !header.is_genesis() => {
                        self.cursor = Some(header.previous_block_id);
                    }
                    Ok(_) => {}
                    Err(err) => return Some(Err(err.into())),
                }
                Some(Ok(block))
            }
            Ok(None) => Some(Err(ChainStoreError::Corruption(format!(
                "chain references missing block {id}"
            )))),
            Err(err) => Some(Err(err)),
        }
    }
}

/// `MerkleNodeStore` over the chain database's node column family.
pub struct OnDiskNodeStore {
    db: Arc<DB>,
}

impl MerkleNodeStore for OnDiskNodeStore {
    fn get_node(&self, hash: &str) -> Result<Option<Vec<u8>>, MerkleError> {
        self.db
            .get::<MerkleNodeSchema>(&hash.to_string())
            .map_err(|e| MerkleError::Store(e.to_string()))
    }

    fn put_nodes(&self, nodes: &[(String, Vec<u8>)]) -> Result<(), MerkleError> {
        let batch = SchemaBatch::new();
        for (hash, bytes) in nodes {
            batch
                .put::<MerkleNodeSchema>(hash, bytes)
                .map_err(|e| MerkleError::Store(e.to_string()))?;
        }
        self.db
            .write_schemas(batch)
            .map_err(|e| MerkleError::Store(e.to_string()))
    }

    fn delete_nodes(&self, hashes: &[String]) -> Result<(), MerkleError> {
        let batch = SchemaBatch::new();
        for hash in hashes {
            batch
                .delete::<MerkleNodeSchema>(hash)
                .map_err(|e| MerkleError::Store(e.to_string()))?;
        }
        self.db
            .write_schemas(batch)
            .map_err(|e| MerkleError::Store(e.to_string()))
    }

    fn node_hashes(&self) -> Result<Vec<String>, MerkleError> {
        let iter = self
            .db
            .iter::<MerkleNodeSchema>()
            .map_err(|e| MerkleError::Store(e.to_string()))?;
        iter.map(|entry| {
            entry
                .map(|(hash, _)| hash)
                .map_err(|e| MerkleError::Store(e.to_string()))
        })
        .collect()
    }
}
