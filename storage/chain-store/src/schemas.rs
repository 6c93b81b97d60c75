// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Column-family schemas for the chain database.

use byteorder::{BigEndian, ByteOrder};
use sawtooth_schemadb::{define_schema, KeyCodec, StoreError, ValueCodec};
use sawtooth_types::{Block, TransactionReceipt};

pub const COLUMN_FAMILIES: &[&str] = &[
    "block",
    "block_num",
    "block_by_batch",
    "block_by_txn",
    "chain_head",
    "receipt",
    "merkle_node",
];

// Primary block table: block id -> serialized block.
define_schema!(BlockSchema, String, Block, "block");
// Height index: block number (big-endian) -> block id.
define_schema!(BlockNumSchema, u64, String, "block_num");
// Secondary indexes into the committed chain.
define_schema!(BlockByBatchSchema, String, String, "block_by_batch");
define_schema!(BlockByTxnSchema, String, String, "block_by_txn");
// Singleton: the current chain head id.
define_schema!(ChainHeadSchema, (), String, "chain_head");
// Off-chain execution records for committed transactions.
define_schema!(ReceiptSchema, String, TransactionReceipt, "receipt");
// Merkle-radix node store: node hash -> serialized node.
define_schema!(MerkleNodeSchema, String, Vec<u8>, "merkle_node");

macro_rules! impl_string_key {
    ($schema:ident) => {
        impl KeyCodec<$schema> for String {
            fn encode_key(&self) -> Result<Vec<u8>, StoreError> {
                Ok(self.as_bytes().to_vec())
            }

            fn decode_key(data: &[u8]) -> Result<Self, StoreError> {
                String::from_utf8(data.to_vec()).map_err(|e| StoreError::Codec(e.to_string()))
            }
        }
    };
}

macro_rules! impl_string_value {
    ($schema:ident) => {
        impl ValueCodec<$schema> for String {
            fn encode_value(&self) -> Result<Vec<u8>, StoreError> {
                Ok(self.as_bytes().to_vec())
            }

            fn decode_value(data: &[u8]) -> Result<Self, StoreError> {
                String::from_utf8(data.to_vec()).map_err(|e| StoreError::Codec(e.to_string()))
            }
        }
    };
}

macro_rules! impl_bcs_value {
    ($schema:ident, $value:ty) => {
        impl ValueCodec<$schema> for $value {
            fn encode_value(&self) -> Result<Vec<u8>, StoreError> {
                bcs::to_bytes(self).map_err(|e| StoreError::Codec(e.to_string()))
            }

            fn decode_value(data: &[u8]) -> Result<Self, StoreError> {
                bcs::from_bytes(data).map_err(|e| StoreError::Codec(e.to_string()))
            }
        }
    };
}

impl_string_key!(BlockSchema);
impl_string_key!(BlockByBatchSchema);
impl_string_key!(BlockByTxnSchema);
impl_string_key!(ReceiptSchema);
impl_string_key!(MerkleNodeSchema);

impl_string_value!(BlockNumSchema);
impl_string_value!(BlockByBatchSchema);
impl_string_value!(BlockByTxnSchema);
impl_string_value!(ChainHeadSchema);

impl_bcs_value!(BlockSchema, Block);
impl_bcs_value!(ReceiptSchema, TransactionReceipt);

impl KeyCodec<BlockNumSchema> for u64 {
    fn encode_key(&self) -> Result<Vec<u8>, StoreError> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, *self);
        Ok(buf.to_vec())
    }

    fn decode_key(data: &[u8]) -> Result<Self, StoreError> {
        if data.len() != 8 {
            return Err(StoreError::Codec("bad block number key".into()));
        }
        Ok(BigEndian::read_u64(data))
    }
}

impl KeyCodec<ChainHeadSchema> for () {
    fn encode_key(&self) -> Result<Vec<u8>, StoreError> {
        Ok(b"chain_head".to_vec())
    }

    fn decode_key(_data: &[u8]) -> Result<Self, StoreError> {
        Ok(())
    }
}

impl ValueCodec<MerkleNodeSchema> for Vec<u8> {
    fn encode_value(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.clone())
    }

    fn decode_value(data: &[u8]) -> Result<Self, StoreError> {
        Ok(data.to_vec())
    }
}
