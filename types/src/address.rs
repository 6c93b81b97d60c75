// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hex length of a full state address (35 bytes).
pub const ADDRESS_HEX_LEN: usize = 70;

/// Hex length of a namespace prefix (3 bytes).
pub const NAMESPACE_HEX_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must be {ADDRESS_HEX_LEN} hex characters, got {0:?}")]
    InvalidLength(String),
    #[error("address contains non-hex characters: {0:?}")]
    NotHex(String),
    #[error("address prefix must be even-length hex of at most {ADDRESS_HEX_LEN} chars: {0:?}")]
    InvalidPrefix(String),
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// A full 70-hex-character state address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Result<Self, AddressError> {
        let addr = addr.into();
        if addr.len() != ADDRESS_HEX_LEN {
            return Err(AddressError::InvalidLength(addr));
        }
        if !is_lower_hex(&addr) {
            return Err(AddressError::NotHex(addr));
        }
        Ok(Self(addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 3-byte namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.0[..NAMESPACE_HEX_LEN]
    }

    /// Whether this address falls under `prefix` (any even-length hex
    /// prefix; the empty prefix matches everything).
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// The raw 35 path bytes; used as radix-tree path segments.
    pub fn path_bytes(&self) -> Vec<u8> {
        hex::decode(&self.0).expect("validated hex")
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

/// Validates a declared input/output entry: even-length lower hex, at most a
/// full address long. A shorter entry addresses the whole subtree under it.
pub fn validate_prefix(prefix: &str) -> Result<(), AddressError> {
    if prefix.len() > ADDRESS_HEX_LEN || prefix.len() % 2 != 0 || !is_lower_hex(prefix) {
        return Err(AddressError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

/// Whether `address` overlaps `declared`: either may be a prefix of the
/// other. Used by the predecessor tree, where two declarations conflict if
/// one subtree contains the other.
pub fn prefixes_overlap(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
