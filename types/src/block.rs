// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Batch, BatchId, BlockId, ProtocolError};
use sawtooth_crypto::{PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// The reserved `previous_block_id` of the genesis block.
pub const NULL_BLOCK_IDENTIFIER: &str = "0000000000000000";

/// The signed portion of a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_num: u64,
    pub previous_block_id: BlockId,
    pub signer_public_key: String,
    pub batch_ids: Vec<BatchId>,
    /// Opaque consensus payload; empty for genesis.
    #[serde(with = "serde_bytes")]
    pub consensus: Vec<u8>,
    pub state_root_hash: String,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bcs::to_bytes(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bcs::from_bytes(bytes)?)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_block_id == NULL_BLOCK_IDENTIFIER
    }
}

/// A signed block: header bytes, header signature (the block id), and the
/// batches in the same order as `batch_ids`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(with = "serde_bytes")]
    pub header: Vec<u8>,
    pub header_signature: String,
    pub batches: Vec<Batch>,
}

impl Block {
    pub fn header(&self) -> Result<BlockHeader, ProtocolError> {
        BlockHeader::from_bytes(&self.header)
    }

    /// Block identity: the header signature.
    pub fn id(&self) -> &str {
        &self.header_signature
    }

    pub fn batch_ids(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().map(|batch| batch.id())
    }

    pub fn verify_signature(&self) -> Result<bool, ProtocolError> {
        let header = self.header()?;
        let public_key = PublicKey::from_hex(&header.signer_public_key)
            .map_err(|e| ProtocolError::Identity(e.to_string()))?;
        let signature = Signature::from_hex(&self.header_signature)
            .map_err(|e| ProtocolError::Identity(e.to_string()))?;
        Ok(public_key.verify(&self.header, &signature))
    }
}

/// Builds and signs blocks; used by the publisher and the genesis path.
pub struct BlockBuilder {
    block_num: u64,
    previous_block_id: BlockId,
    state_root_hash: String,
    consensus: Vec<u8>,
    batches: Vec<Batch>,
}

impl BlockBuilder {
    pub fn new(block_num: u64, previous_block_id: impl Into<BlockId>) -> Self {
        Self {
            block_num,
            previous_block_id: previous_block_id.into(),
            state_root_hash: String::new(),
            consensus: Vec::new(),
            batches: Vec::new(),
        }
    }

    pub fn state_root_hash(mut self, state_root_hash: impl Into<String>) -> Self {
        self.state_root_hash = state_root_hash.into();
        self
    }

    pub fn consensus(mut self, consensus: Vec<u8>) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn batches(mut self, batches: Vec<Batch>) -> Self {
        self.batches = batches;
        self
    }

    pub fn build(self, signer: &PrivateKey) -> Result<Block, ProtocolError> {
        let header = BlockHeader {
            block_num: self.block_num,
            previous_block_id: self.previous_block_id,
            signer_public_key: signer.public_key().as_hex(),
            batch_ids: self
                .batches
                .iter()
                .map(|batch| batch.header_signature.clone())
                .collect(),
            consensus: self.consensus,
            state_root_hash: self.state_root_hash,
        };
        let header_bytes = header.to_bytes()?;
        let signature = signer.sign(&header_bytes);
        Ok(Block {
            header: header_bytes,
            header_signature: signature.as_hex(),
            batches: self.batches,
        })
    }
}
