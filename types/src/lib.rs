// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protocol types shared across the validator: addresses, transactions,
//! batches, blocks, receipts, events and on-chain setting addressing.
//!
//! Every signed record keeps its header as the exact serialized bytes it was
//! signed over; parsing is lazy and verification never re-serializes.

mod address;
mod batch;
mod block;
mod events;
mod receipt;
mod settings;
mod transaction;
pub mod validation;

pub use address::{
    prefixes_overlap, validate_prefix, Address, AddressError, ADDRESS_HEX_LEN, NAMESPACE_HEX_LEN,
};
pub use batch::{Batch, BatchBuilder, BatchHeader};
pub use block::{Block, BlockBuilder, BlockHeader, NULL_BLOCK_IDENTIFIER};
pub use events::{Event, EventAttribute};
pub use receipt::{StateChange, TransactionReceipt};
pub use settings::{setting_address, Setting, SettingEntry, keys as setting_keys};
pub use transaction::{Transaction, TransactionBuilder, TransactionHeader};

use thiserror::Error;

/// Identifiers are header-signature hex strings (128 chars).
pub type TransactionId = String;
pub type BatchId = String;
pub type BlockId = String;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("deserialization failed: {0}")]
    Deserialization(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("malformed identity: {0}")]
    Identity(String),
}

impl From<bcs::Error> for ProtocolError {
    fn from(err: bcs::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
