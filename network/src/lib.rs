// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! The peer network: length-prefixed bcs envelopes over TCP, a
//! trust/challenge authorization handshake, neighbor-of-neighbors peer
//! discovery bounded by minimum and maximum connectivity, and gossip
//! flooding of blocks and batches.
//!
//! The journal never talks sockets: it sees blocks and batches arriving
//! through a [`GossipHandler`] and hands outbound artifacts to
//! [`NetworkService`] methods that are safe to call from plain threads.

mod connection;
mod envelope;
mod handshake;
mod messages;
mod service;

pub use connection::{Connection, ConnectionError};
pub use envelope::{MessageType, NetworkEnvelope, ENVELOPE_VERSION};
pub use handshake::{AllowAllPermissions, NetworkPermissions};
pub use messages::{
    AuthorizationType, ConnectionRequest, ConnectionResponse, GetPeersResponse, GossipPayload,
    PeerRequest, PeerResponse, Role, RoleEntry,
};
pub use service::{GossipHandler, NetworkConfig, NetworkService, PeerState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire encoding error: {0}")]
    Encoding(String),
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("authorization failed: {0}")]
    Unauthorized(String),
    #[error("handshake violation: {0}")]
    HandshakeViolation(String),
}
