// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use sawtooth_state::SettingsView;
use sawtooth_types::{setting_keys, Batch};
use tracing::debug;

/// On-chain transactor permissioning.
///
/// `sawtooth.identity.allowed_keys` holds a comma-separated list of public
/// keys allowed to sign batches and transactions. An unset (or empty)
/// policy allows everyone.
pub struct PermissionVerifier;

impl PermissionVerifier {
    /// Whether every signer involved in `batch` is permitted by the policy
    /// in effect at the given state view.
    pub fn is_batch_allowed(settings: &SettingsView, batch: &Batch) -> bool {
        let allowed = match settings.get_setting_list(setting_keys::ALLOWED_KEYS) {
            Ok(allowed) => allowed,
            Err(err) => {
                debug!(error = %err, "could not read transactor policy; allowing");
                return true;
            }
        };
        if allowed.is_empty() {
            return true;
        }

        let Ok(header) = batch.header() else {
            return false;
        };
        if !allowed.contains(&header.signer_public_key) {
            debug!(batch = %batch.id(), "batch signer not permitted");
            return false;
        }
        for txn in &batch.transactions {
            let Ok(txn_header) = txn.header() else {
                return false;
            };
            if !allowed.contains(&txn_header.signer_public_key) {
                debug!(txn = %txn.id(), "transaction signer not permitted");
                return false;
            }
        }
        true
    }
}
