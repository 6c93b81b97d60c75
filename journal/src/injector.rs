// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use parking_lot::RwLock;
use sawtooth_state::SettingsView;
use sawtooth_types::{setting_keys, Batch, Block};
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// Splices validator-generated batches into a candidate block while it is
/// being built. Injected batches pass the same validation as any other
/// batch.
pub trait BatchInjector: Send + Sync {
    fn block_start(&self, _previous: &Block) -> Vec<Batch> {
        Vec::new()
    }

    fn before_batch(&self, _previous: &Block, _batch: &Batch) -> Vec<Batch> {
        Vec::new()
    }

    fn after_batch(&self, _previous: &Block, _batch: &Batch) -> Vec<Batch> {
        Vec::new()
    }

    fn block_end(&self, _previous: &Block, _batches: &[Batch]) -> Vec<Batch> {
        Vec::new()
    }
}

/// Injector implementations known to this validator, keyed by the name
/// used in `sawtooth.validator.batch_injectors`.
#[derive(Default)]
pub struct InjectorRegistry {
    injectors: RwLock<HashMap<String, Arc<dyn BatchInjector>>>,
}

impl InjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, injector: Arc<dyn BatchInjector>) {
        self.injectors.write().insert(name.to_string(), injector);
    }

    /// The injector set the on-chain configuration asks for, in configured
    /// order. Unknown names are skipped with a warning.
    pub fn resolve(&self, settings: &SettingsView) -> Vec<Arc<dyn BatchInjector>> {
        let configured = match settings.get_setting_list(setting_keys::BATCH_INJECTORS) {
            Ok(configured) => configured,
            Err(err) => {
                warn!(error = %err, "could not read batch injector configuration");
                return Vec::new();
            }
        };
        let injectors = self.injectors.read();
        configured
            .iter()
            .filter_map(|name| {
                let found = injectors.get(name).cloned();
                if found.is_none() {
                    warn!(injector = %name, "configured batch injector is not available");
                }
                found
            })
            .collect()
    }
}
