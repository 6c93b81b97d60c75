// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-node (and three-node) integration tests over real sockets:
//! handshakes, peering bounds, gossip flooding, and request/answer flows.

use parking_lot::Mutex;
use sawtooth_crypto::PrivateKey;
use sawtooth_network::{
    AllowAllPermissions, AuthorizationType, GossipHandler, NetworkConfig, NetworkPermissions,
    NetworkService, Role,
};
use sawtooth_types::{Batch, BatchBuilder, Block, BlockBuilder, NULL_BLOCK_IDENTIFIER};
use std::{sync::Arc, time::Duration};

#[derive(Default)]
struct RecordingHandler {
    blocks: Mutex<Vec<Block>>,
    batches: Mutex<Vec<Batch>>,
    serve_block: Mutex<Option<Block>>,
}

impl GossipHandler for RecordingHandler {
    fn on_block(&self, block: Block) {
        self.blocks.lock().push(block);
    }

    fn on_batch(&self, batch: Batch) {
        self.batches.lock().push(batch);
    }

    fn fetch_block(&self, block_id: &str) -> Option<Block> {
        self.serve_block
            .lock()
            .clone()
            .filter(|block| block.id() == block_id)
    }

    fn fetch_batches_by_transactions(&self, _txn_ids: &[String]) -> Vec<Batch> {
        Vec::new()
    }
}

struct Node {
    service: Arc<NetworkService>,
    handler: Arc<RecordingHandler>,
    endpoint: String,
}

async fn start_node(config: NetworkConfig) -> Node {
    start_node_with_permissions(config, Arc::new(AllowAllPermissions)).await
}

async fn start_node_with_permissions(
    mut config: NetworkConfig,
    permissions: Arc<dyn NetworkPermissions>,
) -> Node {
    config.bind = "127.0.0.1:0".to_string();
    let service = NetworkService::new(config, PrivateKey::generate(), permissions);
    let addr = service.start().await.unwrap();
    // Tests run with explicit calls; the advertised endpoint is the real
    // bound address.
    let handler = Arc::new(RecordingHandler::default());
    service.set_gossip_handler(handler.clone());
    Node {
        service,
        handler,
        endpoint: addr.to_string(),
    }
}

fn test_config() -> NetworkConfig {
    NetworkConfig {
        request_timeout: Duration::from_secs(2),
        discovery_interval: Duration::from_secs(3600),
        ping_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn sample_block() -> Block {
    let signer = PrivateKey::generate();
    BlockBuilder::new(0, NULL_BLOCK_IDENTIFIER)
        .state_root_hash("00".repeat(32))
        .build(&signer)
        .unwrap()
}

fn sample_batch() -> Batch {
    let signer = PrivateKey::generate();
    BatchBuilder::new(vec![]).build(&signer).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn trust_handshake_then_peering() {
    let server = start_node(test_config()).await;
    let client = start_node(test_config()).await;

    let connection = client.service.connect_to(&server.endpoint).await.unwrap();
    assert!(client.service.peer_with(connection).await.unwrap());
    assert_eq!(client.service.peer_count(), 1);
    settle().await;
    assert_eq!(server.service.peer_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn challenge_handshake_authorizes_the_signer() {
    let server = start_node(NetworkConfig {
        auth_type: AuthorizationType::Challenge,
        ..test_config()
    })
    .await;
    let client = start_node(test_config()).await;

    let connection = client.service.connect_to(&server.endpoint).await.unwrap();
    assert!(client.service.peer_with(connection).await.unwrap());
    settle().await;
    assert_eq!(server.service.peer_count(), 1);
}

struct DenyAll;

impl NetworkPermissions for DenyAll {
    fn role_allowed(&self, _public_key: &str, _role: Role) -> bool {
        false
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_roles_abort_the_connection() {
    let server = start_node_with_permissions(test_config(), Arc::new(DenyAll)).await;
    let client = start_node(test_config()).await;
    assert!(client.service.connect_to(&server.endpoint).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn peering_rejected_at_max_connectivity_but_get_peers_still_answered() {
    let server = start_node(NetworkConfig {
        max_peers: 1,
        ..test_config()
    })
    .await;
    let first = start_node(test_config()).await;
    let second = start_node(test_config()).await;

    let connection = first.service.connect_to(&server.endpoint).await.unwrap();
    assert!(first.service.peer_with(connection).await.unwrap());

    let connection = second.service.connect_to(&server.endpoint).await.unwrap();
    assert!(!second.service.peer_with(connection).await.unwrap());
    settle().await;
    assert_eq!(server.service.peer_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_reaches_peers_exactly_once() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;

    let connection = a.service.connect_to(&b.endpoint).await.unwrap();
    assert!(a.service.peer_with(connection).await.unwrap());
    settle().await;

    let block = sample_block();
    let batch = sample_batch();
    a.service.broadcast_block(block.clone());
    a.service.broadcast_batch(batch.clone());
    settle().await;

    let blocks = b.handler.blocks.lock();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].id(), block.id());
    assert_eq!(b.handler.batches.lock().len(), 1);
    // The sender never hears its own gossip back.
    assert!(a.handler.blocks.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_block_request_is_answered_point_to_point() {
    let asker = start_node(test_config()).await;
    let holder = start_node(test_config()).await;

    let block = sample_block();
    *holder.handler.serve_block.lock() = Some(block.clone());

    let connection = asker.service.connect_to(&holder.endpoint).await.unwrap();
    assert!(asker.service.peer_with(connection).await.unwrap());
    settle().await;

    asker.service.request_block(block.id().to_string());
    settle().await;

    let received = asker.handler.blocks.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id(), block.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_reaches_minimum_connectivity() {
    // Hub with fast discovery disabled; spokes discover through seeds.
    let hub = start_node(test_config()).await;
    let spoke = start_node(NetworkConfig {
        seeds: vec![hub.endpoint.clone()],
        min_peers: 1,
        discovery_interval: Duration::from_millis(100),
        ..test_config()
    })
    .await;

    for _ in 0..50 {
        if spoke.service.peer_count() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(spoke.service.peer_count() >= 1);
    settle().await;
    assert!(hub.service.peer_count() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn excessive_pings_abort_the_connection() {
    let server = start_node(NetworkConfig {
        max_pings_per_interval: 2,
        ping_interval: Duration::from_secs(3600),
        ..test_config()
    })
    .await;
    let client = start_node(test_config()).await;

    let connection = client.service.connect_to(&server.endpoint).await.unwrap();
    assert!(client.service.peer_with(connection).await.unwrap());
    settle().await;
    assert_eq!(server.service.connection_count(), 1);

    // Hammer the keep-alive; the third ping crosses the limit.
    for _ in 0..3 {
        let _ = client.service.ping_once(connection).await;
    }
    settle().await;
    assert_eq!(server.service.connection_count(), 0);
}
