// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Authorization policy and the per-connection handshake state.

use crate::messages::Role;
use sawtooth_crypto::{PublicKey, Signature};

/// Role policy consulted when granting roles; backed by on-chain settings
/// in a full deployment.
pub trait NetworkPermissions: Send + Sync {
    fn role_allowed(&self, public_key: &str, role: Role) -> bool;
}

/// Grants every role to every key; the default for development networks.
pub struct AllowAllPermissions;

impl NetworkPermissions for AllowAllPermissions {
    fn role_allowed(&self, _public_key: &str, _role: Role) -> bool {
        true
    }
}

/// Server-side handshake progress for one connection. Receiving a message
/// that does not match the current state aborts the connection.
pub enum AuthState {
    /// Nothing received yet; only `Connect` is legal.
    AwaitingRequest,
    /// A challenge was issued; only `AuthChallengeResponse` is legal.
    AwaitingChallengeResponse {
        payload: Vec<u8>,
        requested_roles: Vec<Role>,
    },
    /// Handshake finished; ordinary traffic under the granted roles.
    Authorized { roles: Vec<Role> },
}

impl AuthState {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthState::Authorized { .. })
    }

    pub fn has_role(&self, role: Role) -> bool {
        match self {
            AuthState::Authorized { roles } => roles.contains(&role),
            _ => false,
        }
    }
}

/// Verifies a challenge response: the claimed key must have signed the
/// exact challenge payload.
pub fn verify_challenge(payload: &[u8], public_key: &str, signature: &str) -> bool {
    let Ok(public_key) = PublicKey::from_hex(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_hex(signature) else {
        return false;
    };
    public_key.verify(payload, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sawtooth_crypto::PrivateKey;

    #[test]
    fn challenge_round_trip() {
        let identity = PrivateKey::generate();
        let payload = b"32 random bytes of challenge....".to_vec();
        let signature = identity.sign(&payload).as_hex();
        assert!(verify_challenge(
            &payload,
            &identity.public_key().as_hex(),
            &signature
        ));
        // A different key cannot answer the challenge.
        let other = PrivateKey::generate();
        assert!(!verify_challenge(
            &payload,
            &other.public_key().as_hex(),
            &signature
        ));
        // A replayed signature over different bytes fails.
        assert!(!verify_challenge(
            b"other payload",
            &identity.public_key().as_hex(),
            &signature
        ));
    }

    #[test]
    fn auth_state_role_checks() {
        let state = AuthState::Authorized {
            roles: vec![Role::Network],
        };
        assert!(state.is_authorized());
        assert!(state.has_role(Role::Network));
        assert!(!state.has_role(Role::Transactor));
        assert!(!AuthState::AwaitingRequest.has_role(Role::Network));
    }
}
