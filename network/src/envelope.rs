// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::NetworkError;
use serde::{Deserialize, Serialize};

/// Current wire version. A peer speaking a different version is
/// disconnected during the handshake.
pub const ENVELOPE_VERSION: u16 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Connect,
    AuthChallenge,
    AuthChallengeResponse,
    AuthResult,
    Ping,
    Pong,
    PeerRequest,
    PeerResponse,
    GetPeersRequest,
    GetPeersResponse,
    Broadcast,
    Send,
    Request,
    Unpeer,
    Disconnect,
    AuthorizationViolation,
}

impl MessageType {
    /// Whether this type answers an earlier request and should be routed to
    /// the waiter registered under its correlation id.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::AuthChallenge
                | MessageType::AuthResult
                | MessageType::Pong
                | MessageType::PeerResponse
                | MessageType::GetPeersResponse
        )
    }
}

/// The versioned, length-prefixed wire envelope. The length prefix itself
/// is applied by the frame codec; everything else is bcs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEnvelope {
    pub version: u16,
    pub message_type: MessageType,
    pub correlation_id: u64,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl NetworkEnvelope {
    pub fn new(message_type: MessageType, correlation_id: u64, content: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message_type,
            correlation_id,
            content,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        bcs::to_bytes(self).map_err(|err| NetworkError::Encoding(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        bcs::from_bytes(bytes).map_err(|err| NetworkError::Encoding(err.to_string()))
    }

    /// Decodes the content as a typed payload.
    pub fn parse<'a, T: Deserialize<'a>>(&'a self) -> Result<T, NetworkError> {
        bcs::from_bytes(&self.content).map_err(|err| NetworkError::Encoding(err.to_string()))
    }
}

/// Encodes a payload for an envelope.
pub fn content<T: Serialize>(payload: &T) -> Result<Vec<u8>, NetworkError> {
    bcs::to_bytes(payload).map_err(|err| NetworkError::Encoding(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = NetworkEnvelope::new(MessageType::Ping, 42, b"payload".to_vec());
        let bytes = envelope.to_bytes().unwrap();
        let restored = NetworkEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(restored, envelope);
        assert_eq!(restored.version, ENVELOPE_VERSION);
    }

    #[test]
    fn response_classification() {
        assert!(MessageType::Pong.is_response());
        assert!(MessageType::GetPeersResponse.is_response());
        assert!(!MessageType::Ping.is_response());
        assert!(!MessageType::Broadcast.is_response());
    }
}
