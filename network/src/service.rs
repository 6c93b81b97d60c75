// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! The network service: listener, per-connection authorization state
//! machine, neighbor-of-neighbors discovery, keep-alive, and gossip.

use crate::{
    connection::{Connection, InboundMessage},
    envelope::{content, MessageType, NetworkEnvelope},
    handshake::{verify_challenge, AuthState, NetworkPermissions},
    messages::{
        AuthChallenge, AuthChallengeResponse, AuthorizationType, ConnectionRequest,
        ConnectionResponse, GetPeersResponse, GossipMessage, GossipPayload, PeerRequest,
        PeerResponse, Role, RoleEntry,
    },
    NetworkError,
};
use parking_lot::Mutex;
use rand::{seq::SliceRandom, RngCore};
use sawtooth_crypto::PrivateKey;
use sawtooth_types::{Batch, Block};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, net::TcpStream, sync::mpsc};
use tracing::{debug, info, warn};

/// Blocks and batches arriving from peers, and the local lookups used to
/// answer gossip requests. The journal side of the seam.
pub trait GossipHandler: Send + Sync {
    fn on_block(&self, block: Block);
    fn on_batch(&self, batch: Batch);
    fn fetch_block(&self, block_id: &str) -> Option<Block>;
    fn fetch_batches_by_transactions(&self, txn_ids: &[String]) -> Vec<Batch>;
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub bind: String,
    /// Endpoint advertised to peers.
    pub public_endpoint: String,
    pub seeds: Vec<String>,
    pub min_peers: usize,
    pub max_peers: usize,
    /// Authorization demanded of inbound connections.
    pub auth_type: AuthorizationType,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    pub discovery_interval: Duration,
    /// Inbound pings tolerated per ping interval before the connection is
    /// treated as abusive.
    pub max_pings_per_interval: u32,
    pub gossip_ttl: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            public_endpoint: String::new(),
            seeds: Vec::new(),
            min_peers: 3,
            max_peers: 10,
            auth_type: AuthorizationType::Trust,
            request_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(10),
            discovery_interval: Duration::from_secs(2),
            max_pings_per_interval: 10,
            gossip_ttl: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Peered,
}

struct PeerEntry {
    connection: Connection,
    endpoint: Option<String>,
    state: PeerState,
    auth: AuthState,
    ping_window_start: Instant,
    pings_in_window: u32,
}

pub struct NetworkService {
    config: NetworkConfig,
    identity: PrivateKey,
    permissions: Arc<dyn NetworkPermissions>,
    handler: Mutex<Option<Arc<dyn GossipHandler>>>,
    peers: Mutex<HashMap<u64, PeerEntry>>,
    known_endpoints: Mutex<HashSet<String>>,
    seen_gossip: Mutex<HashSet<String>>,
    next_connection_id: AtomicU64,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    disconnect_tx: Mutex<Option<mpsc::Sender<u64>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
}

impl NetworkService {
    pub fn new(
        config: NetworkConfig,
        identity: PrivateKey,
        permissions: Arc<dyn NetworkPermissions>,
    ) -> Arc<Self> {
        let known_endpoints = config.seeds.iter().cloned().collect();
        Arc::new(Self {
            config,
            identity,
            permissions,
            handler: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            known_endpoints: Mutex::new(known_endpoints),
            seen_gossip: Mutex::new(HashSet::new()),
            next_connection_id: AtomicU64::new(1),
            inbound_tx: Mutex::new(None),
            disconnect_tx: Mutex::new(None),
            local_addr: Mutex::new(None),
            runtime: Mutex::new(None),
        })
    }

    pub fn set_gossip_handler(&self, handler: Arc<dyn GossipHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Binds the listener and spawns the service loops. Must run inside a
    /// tokio runtime; returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        *self.runtime.lock() = Some(tokio::runtime::Handle::current());

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(256);
        let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<u64>(64);
        *self.inbound_tx.lock() = Some(inbound_tx.clone());
        *self.disconnect_tx.lock() = Some(disconnect_tx.clone());

        // Accept loop.
        let accept_service = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "inbound connection");
                        accept_service.register_inbound(stream);
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                }
            }
        });

        // Dispatch loop.
        let dispatch_service = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                dispatch_service.dispatch(message).await;
            }
        });

        // Disconnect reaper.
        let reap_service = self.clone();
        tokio::spawn(async move {
            while let Some(connection_id) = disconnect_rx.recv().await {
                let removed = reap_service.peers.lock().remove(&connection_id);
                if let Some(entry) = removed {
                    debug!(
                        connection = connection_id,
                        endpoint = ?entry.endpoint,
                        "connection closed"
                    );
                }
            }
        });

        // Discovery loop: keep the peer count inside [min, max].
        let discovery_service = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(discovery_service.config.discovery_interval);
            loop {
                tick.tick().await;
                discovery_service.discover_once().await;
            }
        });

        // Keep-alive loop.
        let ping_service = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ping_service.config.ping_interval);
            loop {
                tick.tick().await;
                ping_service.ping_peers().await;
            }
        });

        info!(%local_addr, "network service started");
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn register_inbound(&self, stream: TcpStream) {
        let (Some(inbound), Some(disconnects)) = (
            self.inbound_tx.lock().clone(),
            self.disconnect_tx.lock().clone(),
        ) else {
            return;
        };
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::spawn(stream, id, inbound, disconnects);
        self.peers.lock().insert(
            id,
            PeerEntry {
                connection,
                endpoint: None,
                state: PeerState::Connected,
                auth: AuthState::AwaitingRequest,
                ping_window_start: Instant::now(),
                pings_in_window: 0,
            },
        );
    }

    /// Dials and authorizes an outbound connection; returns its id.
    pub async fn connect_to(self: &Arc<Self>, endpoint: &str) -> Result<u64, NetworkError> {
        let (Some(inbound), Some(disconnects)) = (
            self.inbound_tx.lock().clone(),
            self.disconnect_tx.lock().clone(),
        ) else {
            return Err(NetworkError::ConnectionClosed);
        };
        let stream = TcpStream::connect(endpoint).await?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::spawn(stream, id, inbound, disconnects);

        let request = ConnectionRequest {
            endpoint: self.config.public_endpoint.clone(),
            public_key: self.identity.public_key().as_hex(),
            requested_roles: vec![RoleEntry {
                role: Role::Network,
                auth_type: self.config.auth_type,
            }],
        };
        let response = connection
            .request(
                MessageType::Connect,
                content(&request)?,
                self.config.request_timeout,
            )
            .await
            .map_err(|err| NetworkError::HandshakeViolation(err.to_string()))?;

        let granted = match response.message_type {
            MessageType::AuthResult => response.parse::<ConnectionResponse>()?.granted_roles,
            MessageType::AuthChallenge => {
                let challenge: AuthChallenge = response.parse()?;
                let answer = AuthChallengeResponse {
                    public_key: self.identity.public_key().as_hex(),
                    signature: self.identity.sign(&challenge.payload).as_hex(),
                };
                let result = connection
                    .request(
                        MessageType::AuthChallengeResponse,
                        content(&answer)?,
                        self.config.request_timeout,
                    )
                    .await
                    .map_err(|err| NetworkError::HandshakeViolation(err.to_string()))?;
                if result.message_type != MessageType::AuthResult {
                    connection.close();
                    return Err(NetworkError::HandshakeViolation(
                        "expected an authorization result".to_string(),
                    ));
                }
                result.parse::<ConnectionResponse>()?.granted_roles
            }
            _ => {
                connection.close();
                return Err(NetworkError::HandshakeViolation(
                    "unexpected handshake reply".to_string(),
                ));
            }
        };
        if granted.is_empty() {
            connection.close();
            return Err(NetworkError::Unauthorized("no roles granted".to_string()));
        }

        self.peers.lock().insert(
            id,
            PeerEntry {
                connection,
                endpoint: Some(endpoint.to_string()),
                state: PeerState::Connected,
                // We dialed them; grant the remote the network role on this
                // connection so its gossip is accepted.
                auth: AuthState::Authorized {
                    roles: vec![Role::Network],
                },
                ping_window_start: Instant::now(),
                pings_in_window: 0,
            },
        );
        self.known_endpoints.lock().insert(endpoint.to_string());
        Ok(id)
    }

    /// Asks `connection_id` for bidirectional peering.
    pub async fn peer_with(&self, connection_id: u64) -> Result<bool, NetworkError> {
        let connection = self
            .connection(connection_id)
            .ok_or(NetworkError::ConnectionClosed)?;
        let request = PeerRequest {
            endpoint: self.config.public_endpoint.clone(),
        };
        let response = connection
            .request(
                MessageType::PeerRequest,
                content(&request)?,
                self.config.request_timeout,
            )
            .await
            .map_err(|_| NetworkError::Timeout)?;
        let accepted = response.parse::<PeerResponse>()?.accepted;
        if accepted {
            if let Some(entry) = self.peers.lock().get_mut(&connection_id) {
                entry.state = PeerState::Peered;
            }
        }
        Ok(accepted)
    }

    fn connection(&self, connection_id: u64) -> Option<Connection> {
        self.peers
            .lock()
            .get(&connection_id)
            .map(|entry| entry.connection.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|entry| entry.state == PeerState::Peered)
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn peered_connections(&self) -> Vec<(u64, Connection)> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Peered)
            .map(|(id, entry)| (*id, entry.connection.clone()))
            .collect()
    }

    fn peered_endpoints(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter(|entry| entry.state == PeerState::Peered)
            .filter_map(|entry| entry.endpoint.clone())
            .collect()
    }

    /// One round of neighbor-of-neighbors discovery.
    async fn discover_once(self: &Arc<Self>) {
        if self.peer_count() >= self.config.min_peers {
            return;
        }

        // Connect to a candidate endpoint we are not connected to yet.
        let connected: HashSet<String> = self
            .peers
            .lock()
            .values()
            .filter_map(|entry| entry.endpoint.clone())
            .collect();
        let candidates: Vec<String> = {
            let known = self.known_endpoints.lock();
            known
                .iter()
                .filter(|endpoint| {
                    !connected.contains(*endpoint) && **endpoint != self.config.public_endpoint
                })
                .cloned()
                .collect()
        };
        let candidate = candidates.choose(&mut rand::thread_rng()).cloned();
        if let Some(endpoint) = candidate {
            if let Err(err) = self.connect_to(&endpoint).await {
                debug!(endpoint = %endpoint, error = %err, "candidate connection failed");
            }
        }

        // Expand the candidate pool from a random peer.
        let peered = self.peered_connections();
        let expansion_peer = peered
            .choose(&mut rand::thread_rng())
            .map(|(_, connection)| connection.clone());
        if let Some(connection) = expansion_peer {
            if let Ok(response) = connection
                .request(
                    MessageType::GetPeersRequest,
                    Vec::new(),
                    self.config.request_timeout,
                )
                .await
            {
                if let Ok(peers) = response.parse::<GetPeersResponse>() {
                    let mut known = self.known_endpoints.lock();
                    for endpoint in peers.endpoints {
                        if endpoint != self.config.public_endpoint {
                            known.insert(endpoint);
                        }
                    }
                }
            }
        }

        // Promote one connected-but-unpeered candidate, chosen at random.
        let unpeered: Vec<u64> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, entry)| {
                entry.state == PeerState::Connected && entry.endpoint.is_some()
            })
            .map(|(id, _)| *id)
            .collect();
        let promotion = unpeered.choose(&mut rand::thread_rng()).copied();
        if let Some(connection_id) = promotion {
            match self.peer_with(connection_id).await {
                Ok(true) => debug!(connection = connection_id, "peered"),
                Ok(false) => debug!(connection = connection_id, "peering rejected"),
                Err(err) => debug!(connection = connection_id, error = %err, "peering failed"),
            }
        }
    }

    /// One keep-alive probe of a specific connection.
    pub async fn ping_once(&self, connection_id: u64) -> Result<(), NetworkError> {
        let connection = self
            .connection(connection_id)
            .ok_or(NetworkError::ConnectionClosed)?;
        connection
            .request(MessageType::Ping, Vec::new(), self.config.request_timeout)
            .await
            .map(|_| ())
            .map_err(|_| NetworkError::Timeout)
    }

    /// Pings every peer; unresponsive peers are unpeered and dropped so
    /// discovery can replace them.
    async fn ping_peers(&self) {
        for (connection_id, connection) in self.peered_connections() {
            let outcome = connection
                .request(MessageType::Ping, Vec::new(), self.config.request_timeout)
                .await;
            if outcome.is_err() {
                warn!(connection = connection_id, "peer missed keep-alive; unpeering");
                connection.close();
                self.peers.lock().remove(&connection_id);
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        let InboundMessage {
            connection_id,
            envelope,
        } = message;
        let Some(connection) = self.connection(connection_id) else {
            return;
        };

        match envelope.message_type {
            MessageType::Connect => self.handle_connect(connection_id, &connection, &envelope).await,
            MessageType::AuthChallengeResponse => {
                self.handle_challenge_response(connection_id, &connection, &envelope)
                    .await
            }
            MessageType::Ping => self.handle_ping(connection_id, &connection, &envelope).await,
            MessageType::PeerRequest => {
                self.handle_peer_request(connection_id, &connection, &envelope)
                    .await
            }
            MessageType::GetPeersRequest => {
                // Answered even when saturated.
                let response = GetPeersResponse {
                    endpoints: self.peered_endpoints(),
                };
                if let Ok(bytes) = content(&response) {
                    let _ = connection
                        .reply(MessageType::GetPeersResponse, envelope.correlation_id, bytes)
                        .await;
                }
            }
            MessageType::Broadcast => {
                self.handle_gossip(connection_id, &envelope, true).await;
            }
            MessageType::Request => {
                self.handle_gossip_request(connection_id, &connection, &envelope)
                    .await;
            }
            MessageType::Send => {
                self.handle_gossip(connection_id, &envelope, false).await;
            }
            MessageType::Unpeer => {
                if let Some(entry) = self.peers.lock().get_mut(&connection_id) {
                    entry.state = PeerState::Connected;
                }
            }
            MessageType::Disconnect | MessageType::AuthorizationViolation => {
                connection.close();
                self.peers.lock().remove(&connection_id);
            }
            other => {
                debug!(connection = connection_id, ?other, "unexpected message type");
                self.abort_connection(connection_id, "unexpected message")
                    .await;
            }
        }
    }

    async fn handle_connect(
        self: &Arc<Self>,
        connection_id: u64,
        connection: &Connection,
        envelope: &NetworkEnvelope,
    ) {
        let in_order = matches!(
            self.peers.lock().get(&connection_id).map(|e| &e.auth),
            Some(AuthState::AwaitingRequest)
        );
        if !in_order {
            // Duplicate Connect is a handshake violation.
            self.abort_connection(connection_id, "duplicate connect").await;
            return;
        }
        let Ok(request) = envelope.parse::<ConnectionRequest>() else {
            self.abort_connection(connection_id, "malformed connect").await;
            return;
        };
        let requested: Vec<Role> = request
            .requested_roles
            .iter()
            .map(|entry| entry.role)
            .collect();

        match self.config.auth_type {
            AuthorizationType::Trust => {
                let granted: Vec<Role> = requested
                    .into_iter()
                    .filter(|role| self.permissions.role_allowed(&request.public_key, *role))
                    .collect();
                if granted.is_empty() {
                    self.abort_connection(connection_id, "no grantable roles").await;
                    return;
                }
                {
                    let mut peers = self.peers.lock();
                    if let Some(entry) = peers.get_mut(&connection_id) {
                        entry.auth = AuthState::Authorized {
                            roles: granted.clone(),
                        };
                        if !request.endpoint.is_empty() {
                            entry.endpoint = Some(request.endpoint.clone());
                        }
                    }
                }
                if !request.endpoint.is_empty() {
                    self.known_endpoints.lock().insert(request.endpoint);
                }
                let response = ConnectionResponse {
                    granted_roles: granted,
                };
                if let Ok(bytes) = content(&response) {
                    let _ = connection
                        .reply(MessageType::AuthResult, envelope.correlation_id, bytes)
                        .await;
                }
            }
            AuthorizationType::Challenge => {
                let mut payload = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut payload);
                {
                    let mut peers = self.peers.lock();
                    if let Some(entry) = peers.get_mut(&connection_id) {
                        entry.auth = AuthState::AwaitingChallengeResponse {
                            payload: payload.clone(),
                            requested_roles: requested,
                        };
                        if !request.endpoint.is_empty() {
                            entry.endpoint = Some(request.endpoint.clone());
                        }
                    }
                }
                let challenge = AuthChallenge { payload };
                if let Ok(bytes) = content(&challenge) {
                    let _ = connection
                        .reply(MessageType::AuthChallenge, envelope.correlation_id, bytes)
                        .await;
                }
            }
        }
    }

    async fn handle_challenge_response(
        self: &Arc<Self>,
        connection_id: u64,
        connection: &Connection,
        envelope: &NetworkEnvelope,
    ) {
        let pending = {
            let peers = self.peers.lock();
            match peers.get(&connection_id).map(|entry| &entry.auth) {
                Some(AuthState::AwaitingChallengeResponse {
                    payload,
                    requested_roles,
                }) => Some((payload.clone(), requested_roles.clone())),
                _ => None,
            }
        };
        let Some((payload, requested)) = pending else {
            self.abort_connection(connection_id, "challenge response out of order")
                .await;
            return;
        };
        let Ok(answer) = envelope.parse::<AuthChallengeResponse>() else {
            self.abort_connection(connection_id, "malformed challenge response")
                .await;
            return;
        };
        if !verify_challenge(&payload, &answer.public_key, &answer.signature) {
            self.abort_connection(connection_id, "challenge signature invalid")
                .await;
            return;
        }
        let granted: Vec<Role> = requested
            .into_iter()
            .filter(|role| self.permissions.role_allowed(&answer.public_key, *role))
            .collect();
        if granted.is_empty() {
            self.abort_connection(connection_id, "no grantable roles").await;
            return;
        }
        if let Some(entry) = self.peers.lock().get_mut(&connection_id) {
            entry.auth = AuthState::Authorized {
                roles: granted.clone(),
            };
        }
        let response = ConnectionResponse {
            granted_roles: granted,
        };
        if let Ok(bytes) = content(&response) {
            let _ = connection
                .reply(MessageType::AuthResult, envelope.correlation_id, bytes)
                .await;
        }
    }

    async fn handle_ping(
        self: &Arc<Self>,
        connection_id: u64,
        connection: &Connection,
        envelope: &NetworkEnvelope,
    ) {
        let over_limit = {
            let mut peers = self.peers.lock();
            let Some(entry) = peers.get_mut(&connection_id) else {
                return;
            };
            if !entry.auth.is_authorized() {
                true
            } else {
                if entry.ping_window_start.elapsed() > self.config.ping_interval {
                    entry.ping_window_start = Instant::now();
                    entry.pings_in_window = 0;
                }
                entry.pings_in_window += 1;
                entry.pings_in_window > self.config.max_pings_per_interval
            }
        };
        if over_limit {
            self.abort_connection(connection_id, "ping rate exceeded").await;
            return;
        }
        let _ = connection
            .reply(MessageType::Pong, envelope.correlation_id, Vec::new())
            .await;
    }

    async fn handle_peer_request(
        self: &Arc<Self>,
        connection_id: u64,
        connection: &Connection,
        envelope: &NetworkEnvelope,
    ) {
        if !self.require_role(connection_id, Role::Network).await {
            return;
        }
        let Ok(request) = envelope.parse::<PeerRequest>() else {
            self.abort_connection(connection_id, "malformed peer request").await;
            return;
        };
        let accepted = self.peer_count() < self.config.max_peers;
        if accepted {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(&connection_id) {
                entry.state = PeerState::Peered;
                if !request.endpoint.is_empty() {
                    entry.endpoint = Some(request.endpoint.clone());
                }
            }
            if !request.endpoint.is_empty() {
                self.known_endpoints.lock().insert(request.endpoint);
            }
        }
        let response = PeerResponse { accepted };
        if let Ok(bytes) = content(&response) {
            let _ = connection
                .reply(MessageType::PeerResponse, envelope.correlation_id, bytes)
                .await;
        }
    }

    async fn handle_gossip(self: &Arc<Self>, connection_id: u64, envelope: &NetworkEnvelope, reflood: bool) {
        if !self.require_role(connection_id, Role::Network).await {
            return;
        }
        let Ok(message) = envelope.parse::<GossipMessage>() else {
            self.abort_connection(connection_id, "malformed gossip").await;
            return;
        };
        if !self.first_sighting(&message.payload) {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            match &message.payload {
                GossipPayload::Block(block) => handler.on_block(block.clone()),
                GossipPayload::Batch(batch) => handler.on_batch(batch.clone()),
                _ => {}
            }
        }
        if reflood && message.time_to_live > 1 {
            self.flood(
                GossipMessage {
                    payload: message.payload,
                    time_to_live: message.time_to_live - 1,
                },
                MessageType::Broadcast,
                Some(connection_id),
            )
            .await;
        }
    }

    async fn handle_gossip_request(
        self: &Arc<Self>,
        connection_id: u64,
        connection: &Connection,
        envelope: &NetworkEnvelope,
    ) {
        if !self.require_role(connection_id, Role::Network).await {
            return;
        }
        let Ok(message) = envelope.parse::<GossipMessage>() else {
            self.abort_connection(connection_id, "malformed gossip request").await;
            return;
        };
        if !self.first_sighting(&message.payload) {
            return;
        }
        let handler = self.handler.lock().clone();
        let answers: Vec<GossipPayload> = match (&message.payload, handler) {
            (GossipPayload::BlockRequest { block_id }, Some(handler)) => handler
                .fetch_block(block_id)
                .map(GossipPayload::Block)
                .into_iter()
                .collect(),
            (GossipPayload::BatchesByTransactionRequest { txn_ids }, Some(handler)) => handler
                .fetch_batches_by_transactions(txn_ids)
                .into_iter()
                .map(GossipPayload::Batch)
                .collect(),
            _ => Vec::new(),
        };

        if answers.is_empty() {
            // Nothing local; keep the request flooding outward.
            if message.time_to_live > 1 {
                self.flood(
                    GossipMessage {
                        payload: message.payload,
                        time_to_live: message.time_to_live - 1,
                    },
                    MessageType::Request,
                    Some(connection_id),
                )
                .await;
            }
            return;
        }
        for payload in answers {
            let reply = GossipMessage {
                payload,
                time_to_live: 1,
            };
            if let Ok(bytes) = content(&reply) {
                let _ = connection.send(MessageType::Send, bytes).await;
            }
        }
    }

    /// Records the content id; returns whether it was new.
    fn first_sighting(&self, payload: &GossipPayload) -> bool {
        let mut seen = self.seen_gossip.lock();
        if seen.len() > 10_000 {
            seen.clear();
        }
        seen.insert(payload.content_id())
    }

    async fn require_role(self: &Arc<Self>, connection_id: u64, role: Role) -> bool {
        let allowed = self
            .peers
            .lock()
            .get(&connection_id)
            .map(|entry| entry.auth.has_role(role))
            .unwrap_or(false);
        if !allowed {
            self.abort_connection(connection_id, "message outside granted roles")
                .await;
        }
        allowed
    }

    /// Sends an `AuthorizationViolation` and drops the connection.
    async fn abort_connection(self: &Arc<Self>, connection_id: u64, reason: &str) {
        warn!(connection = connection_id, reason, "aborting connection");
        let entry = self.peers.lock().remove(&connection_id);
        if let Some(entry) = entry {
            let _ = entry
                .connection
                .send(MessageType::AuthorizationViolation, Vec::new())
                .await;
            entry.connection.close();
        }
    }

    async fn flood(
        self: &Arc<Self>,
        message: GossipMessage,
        message_type: MessageType,
        exclude: Option<u64>,
    ) {
        let Ok(bytes) = content(&message) else { return };
        for (connection_id, connection) in self.peered_connections() {
            if Some(connection_id) == exclude {
                continue;
            }
            let _ = connection.send(message_type, bytes.clone()).await;
        }
    }

    fn spawn_on_runtime(self: &Arc<Self>, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = self.runtime.lock().clone();
        if let Some(handle) = handle {
            handle.spawn(task);
        }
    }

    /// Gossips a block to the network (thread-safe, fire-and-forget).
    pub fn broadcast_block(self: &Arc<Self>, block: Block) {
        let service = self.clone();
        let ttl = self.config.gossip_ttl;
        self.spawn_on_runtime(async move {
            let message = GossipMessage {
                payload: GossipPayload::Block(block),
                time_to_live: ttl,
            };
            service.first_sighting(&message.payload);
            service.flood(message, MessageType::Broadcast, None).await;
        });
    }

    /// Gossips a batch to the network (thread-safe, fire-and-forget).
    pub fn broadcast_batch(self: &Arc<Self>, batch: Batch) {
        let service = self.clone();
        let ttl = self.config.gossip_ttl;
        self.spawn_on_runtime(async move {
            let message = GossipMessage {
                payload: GossipPayload::Batch(batch),
                time_to_live: ttl,
            };
            service.first_sighting(&message.payload);
            service.flood(message, MessageType::Broadcast, None).await;
        });
    }

    /// Floods a request for a missing block (thread-safe).
    pub fn request_block(self: &Arc<Self>, block_id: String) {
        let service = self.clone();
        let ttl = self.config.gossip_ttl;
        self.spawn_on_runtime(async move {
            let message = GossipMessage {
                payload: GossipPayload::BlockRequest { block_id },
                time_to_live: ttl,
            };
            service.flood(message, MessageType::Request, None).await;
        });
    }

    /// Floods a request for the batches containing the given transactions
    /// (thread-safe).
    pub fn request_batches_by_transactions(self: &Arc<Self>, txn_ids: Vec<String>) {
        let service = self.clone();
        let ttl = self.config.gossip_ttl;
        self.spawn_on_runtime(async move {
            let message = GossipMessage {
                payload: GossipPayload::BatchesByTransactionRequest { txn_ids },
                time_to_live: ttl,
            };
            service.flood(message, MessageType::Request, None).await;
        });
    }
}
