// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed payloads carried in envelope `content`.

use sawtooth_types::{Batch, Block};
use serde::{Deserialize, Serialize};

/// Granted capabilities on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Connectivity traffic: peering, discovery, gossip.
    Network,
    /// Submitting batches into this validator.
    Transactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationType {
    Trust,
    Challenge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    pub role: Role,
    pub auth_type: AuthorizationType,
}

/// First message on every connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub endpoint: String,
    pub public_key: String,
    pub requested_roles: Vec<RoleEntry>,
}

/// Ends the handshake: the roles the responder granted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub granted_roles: Vec<Role>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthChallenge {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthChallengeResponse {
    pub public_key: String,
    /// Hex compact signature over the challenge payload.
    pub signature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRequest {
    pub endpoint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerResponse {
    pub accepted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPeersResponse {
    pub endpoints: Vec<String>,
}

/// What gossip carries. Requests flood outward and are answered with a
/// point-to-point `Send` of the matching payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipPayload {
    Block(Block),
    Batch(Batch),
    BlockRequest { block_id: String },
    BatchesByTransactionRequest { txn_ids: Vec<String> },
}

impl GossipPayload {
    /// Dedup key for flood suppression.
    pub fn content_id(&self) -> String {
        match self {
            GossipPayload::Block(block) => format!("block:{}", block.id()),
            GossipPayload::Batch(batch) => format!("batch:{}", batch.id()),
            GossipPayload::BlockRequest { block_id } => format!("block-req:{block_id}"),
            GossipPayload::BatchesByTransactionRequest { txn_ids } => {
                format!("batch-req:{}", txn_ids.join(","))
            }
        }
    }
}

/// Gossip envelope content: payload plus remaining flood hops.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipMessage {
    pub payload: GossipPayload,
    pub time_to_live: u8,
}
