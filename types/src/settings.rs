// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! On-chain setting addressing.
//!
//! Settings live in the `000000` namespace. A key is split on `.` into at
//! most four parts (padded with empty parts), and each part contributes the
//! first 16 hex chars of its SHA-256 digest, yielding a 70-hex address.

use crate::Address;
use sawtooth_crypto::sha256_hex;
use serde::{Deserialize, Serialize};

pub const SETTINGS_NAMESPACE: &str = "000000";
const ADDRESS_PART_COUNT: usize = 4;
const ADDRESS_PART_HEX_LEN: usize = 16;

/// Authoritative setting keys read by the core.
pub mod keys {
    pub const CONSENSUS_ALGORITHM_NAME: &str = "sawtooth.consensus.algorithm.name";
    pub const CONSENSUS_ALGORITHM_VERSION: &str = "sawtooth.consensus.algorithm.version";
    pub const BATCH_INJECTORS: &str = "sawtooth.validator.batch_injectors";
    pub const BLOCK_VALIDATION_RULES: &str = "sawtooth.validator.block_validation_rules";
    pub const TRANSACTION_FAMILIES: &str = "sawtooth.validator.transaction_families";
    pub const ALLOWED_KEYS: &str = "sawtooth.identity.allowed_keys";
}

fn address_part(part: &str) -> String {
    sha256_hex(part.as_bytes())[..ADDRESS_PART_HEX_LEN].to_string()
}

/// The state address a setting key is stored at.
pub fn setting_address(key: &str) -> Address {
    let mut parts: Vec<&str> = key.splitn(ADDRESS_PART_COUNT, '.').collect();
    parts.resize(ADDRESS_PART_COUNT, "");
    let suffix: String = parts.iter().map(|part| address_part(part)).collect();
    Address::new(format!("{SETTINGS_NAMESPACE}{suffix}")).expect("setting addresses are well-formed")
}

/// One key/value entry in a stored setting value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: String,
}

/// The value stored at a setting address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub entries: Vec<SettingEntry>,
}

impl Setting {
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entries: vec![SettingEntry {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_live_in_settings_namespace() {
        let addr = setting_address(keys::BLOCK_VALIDATION_RULES);
        assert_eq!(addr.namespace(), SETTINGS_NAMESPACE);
        assert_eq!(addr.as_str().len(), 70);
    }

    #[test]
    fn addressing_is_deterministic_and_distinct() {
        assert_eq!(
            setting_address("sawtooth.consensus.algorithm.name"),
            setting_address("sawtooth.consensus.algorithm.name"),
        );
        assert_ne!(
            setting_address("sawtooth.consensus.algorithm.name"),
            setting_address("sawtooth.consensus.algorithm.version"),
        );
    }

    #[test]
    fn overlong_keys_collapse_into_the_fourth_part() {
        // splitn keeps the remainder in the last part, so these differ.
        assert_ne!(
            setting_address("a.b.c.d.e"),
            setting_address("a.b.c.d"),
        );
    }

    #[test]
    fn setting_lookup() {
        let setting = Setting::single("sawtooth.x", "on");
        assert_eq!(setting.get("sawtooth.x"), Some("on"));
        assert_eq!(setting.get("other"), None);
    }
}
