// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Address, Event, TransactionId};
use serde::{Deserialize, Serialize};

/// A single state mutation produced by a transaction, in application order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChange {
    Set {
        address: Address,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        address: Address,
    },
}

impl StateChange {
    pub fn address(&self) -> &Address {
        match self {
            StateChange::Set { address, .. } | StateChange::Delete { address } => address,
        }
    }
}

/// The off-chain execution record of one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,
    pub state_changes: Vec<StateChange>,
    pub events: Vec<Event>,
    /// Opaque transaction-family data, in submission order.
    pub data: Vec<Vec<u8>>,
}
