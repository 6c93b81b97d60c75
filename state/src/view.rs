// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::StateError;
use sawtooth_merkle::{MerkleNodeStore, MerkleRadixTree};
use sawtooth_types::{setting_address, Address, Setting};
use std::sync::Arc;

/// A read-only view of global state at a fixed root.
pub struct StateView {
    tree: MerkleRadixTree,
    root: String,
}

impl StateView {
    pub fn new(store: Arc<dyn MerkleNodeStore>, state_root: &str) -> Result<Self, StateError> {
        Ok(Self {
            tree: MerkleRadixTree::new(store, Some(state_root))?,
            root: state_root.to_string(),
        })
    }

    pub fn state_root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.tree.get(address)?)
    }

    pub fn leaves(&self, prefix: &str) -> Result<Vec<(Address, Vec<u8>)>, StateError> {
        Ok(self.tree.leaves(prefix)?)
    }
}

/// On-chain settings at a fixed state root.
pub struct SettingsView {
    state: StateView,
}

impl SettingsView {
    pub fn new(store: Arc<dyn MerkleNodeStore>, state_root: &str) -> Result<Self, StateError> {
        Ok(Self {
            state: StateView::new(store, state_root)?,
        })
    }

    /// The authoritative string value of `key`, if set.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StateError> {
        let address = setting_address(key);
        let Some(bytes) = self.state.get(&address)? else {
            return Ok(None);
        };
        let setting: Setting = bcs::from_bytes(&bytes).map_err(|e| StateError::BadSetting {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        Ok(setting.get(key).map(str::to_string))
    }

    /// A comma-separated list setting, split and trimmed. An unset key is an
    /// empty list.
    pub fn get_setting_list(&self, key: &str) -> Result<Vec<String>, StateError> {
        Ok(self
            .get_setting(key)?
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some_eq};
    use sawtooth_merkle::InMemoryNodeStore;
    use sawtooth_types::setting_keys;

    fn root_with_setting(key: &str, value: &str) -> (Arc<dyn MerkleNodeStore>, String) {
        let store: Arc<dyn MerkleNodeStore> = Arc::new(InMemoryNodeStore::new());
        let tree = MerkleRadixTree::new(store.clone(), None).unwrap();
        let setting = Setting::single(key, value);
        let root = tree
            .update(
                &[(setting_address(key), bcs::to_bytes(&setting).unwrap())],
                &[],
            )
            .unwrap();
        (store, root)
    }

    #[test]
    fn reads_settings_from_state() {
        let (store, root) =
            root_with_setting(setting_keys::BLOCK_VALIDATION_RULES, "NofX:2,intkey");
        let view = SettingsView::new(store, &root).unwrap();
        assert_some_eq!(
            view.get_setting(setting_keys::BLOCK_VALIDATION_RULES).unwrap(),
            "NofX:2,intkey".to_string()
        );
        assert_none!(view.get_setting(setting_keys::BATCH_INJECTORS).unwrap());
    }

    #[test]
    fn list_settings_split_on_commas() {
        let (store, root) =
            root_with_setting(setting_keys::BATCH_INJECTORS, "block_info, other ,");
        let view = SettingsView::new(store, &root).unwrap();
        assert_eq!(
            view.get_setting_list(setting_keys::BATCH_INJECTORS).unwrap(),
            vec!["block_info".to_string(), "other".to_string()]
        );
        assert!(view
            .get_setting_list(setting_keys::TRANSACTION_FAMILIES)
            .unwrap()
            .is_empty());
    }
}
