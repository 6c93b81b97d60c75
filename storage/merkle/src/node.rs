// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::MerkleError;
use sawtooth_crypto::sha512_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hex length of a node key: the first 64 hex chars of SHA-512.
pub const NODE_KEY_HEX_LEN: usize = 64;

/// One radix node. `children` maps a path byte to the key of the child node;
/// `value` is set at terminal positions (full 35-byte paths).
///
/// The BTreeMap keeps the serialization deterministic: children are always
/// emitted in ascending edge order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub children: BTreeMap<u8, String>,
    pub value: Option<Vec<u8>>,
}

impl Node {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.value.is_none()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MerkleError> {
        bcs::to_bytes(self).map_err(|e| MerkleError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MerkleError> {
        bcs::from_bytes(bytes).map_err(|e| MerkleError::Serialization(e.to_string()))
    }
}

/// The key of a node: SHA-512 of its serialization, truncated to 64 hex
/// chars.
pub fn node_hash(serialized: &[u8]) -> String {
    sha512_hex(serialized)[..NODE_KEY_HEX_LEN].to_string()
}
