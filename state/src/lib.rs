// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Execution state plumbing: per-transaction contexts layered over a state
//! root, and read-only views (including the on-chain settings view) derived
//! from a root.

mod context;
mod manager;
mod view;

pub use context::{Context, ContextId};
pub use manager::ContextManager;
pub use view::{SettingsView, StateView};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// An address was touched outside the transaction's declared inputs or
    /// outputs. Execution layers surface this as an invalid transaction
    /// ("unauthorized address set").
    #[error("{op} of {address} outside declared address set")]
    Authorization { op: &'static str, address: String },
    #[error("unknown context {0}")]
    UnknownContext(String),
    #[error(transparent)]
    Merkle(#[from] sawtooth_merkle::MerkleError),
    #[error("malformed setting value at {address}: {reason}")]
    BadSetting { address: String, reason: String },
}
