// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Drives the journal end to end over a real chain store: genesis, block
//! validation and commit, fork switching, on-chain validation rules, and
//! candidate-block publishing.

use claims::{assert_ok, assert_some_eq};
use parking_lot::Mutex;
use sawtooth_chain_store::ChainStore;
use sawtooth_consensus::ConsensusRegistry;
use sawtooth_crypto::PrivateKey;
use sawtooth_executor::{
    ExecutorConfig, ProcessorRegistry, TpProcessRequest, TpProcessResponse, TransactionExecutor,
    TransactionProcessor,
};
use sawtooth_journal::{
    BlockBroadcaster, BlockCache, BlockPublisher, BlockValidator, ChainController,
    ChainControllerConfig, GenesisController, InjectorRegistry, PublisherConfig,
};
use sawtooth_merkle::MerkleRadixTree;
use sawtooth_scheduler::{Scheduler, SchedulerKind};
use sawtooth_state::ContextManager;
use sawtooth_types::{
    setting_address, Address, Batch, BatchBuilder, Block, BlockBuilder, Setting,
    TransactionBuilder,
};
use std::{sync::Arc, time::Duration};

const DEVMODE_PAYLOAD: &[u8] = b"Devmode";

fn addr(seed: u8) -> Address {
    Address::new(format!("{seed:02x}").repeat(35)).unwrap()
}

/// `set <seed> <value>` / `inc <seed>` over single-byte counters.
struct CounterProcessor {
    manager: Arc<ContextManager>,
}

impl TransactionProcessor for CounterProcessor {
    fn process(&self, request: TpProcessRequest) -> TpProcessResponse {
        let payload = String::from_utf8(request.payload.clone()).unwrap_or_default();
        let parts: Vec<&str> = payload.split_whitespace().collect();
        let outcome = (|| -> Result<(), String> {
            match parts.first() {
                Some(&"set") => {
                    let seed: u8 = parts[1].parse().map_err(|_| "bad seed")?;
                    let value: u8 = parts[2].parse().map_err(|_| "bad value")?;
                    self.manager
                        .set(&request.context_id, vec![(addr(seed), vec![value])])
                        .map_err(|err| err.to_string())
                }
                Some(&"inc") => {
                    let seed: u8 = parts[1].parse().map_err(|_| "bad seed")?;
                    let current = self
                        .manager
                        .get(&request.context_id, &[addr(seed)])
                        .map_err(|err| err.to_string())?[0]
                        .clone()
                        .map(|v| v[0])
                        .unwrap_or(0);
                    self.manager
                        .set(&request.context_id, vec![(addr(seed), vec![current + 1])])
                        .map_err(|err| err.to_string())
                }
                _ => Err("unknown op".to_string()),
            }
        })();
        match outcome {
            Ok(()) => TpProcessResponse::ok(),
            Err(message) => TpProcessResponse::invalid(message),
        }
    }
}

/// `<key>\n<value>`: writes an on-chain setting.
struct SettingsProcessor {
    manager: Arc<ContextManager>,
}

impl TransactionProcessor for SettingsProcessor {
    fn process(&self, request: TpProcessRequest) -> TpProcessResponse {
        let payload = String::from_utf8(request.payload.clone()).unwrap_or_default();
        let Some((key, value)) = payload.split_once('\n') else {
            return TpProcessResponse::invalid("malformed setting payload");
        };
        let setting = Setting::single(key, value);
        match self.manager.set(
            &request.context_id,
            vec![(setting_address(key), bcs::to_bytes(&setting).unwrap())],
        ) {
            Ok(()) => TpProcessResponse::ok(),
            Err(err) => TpProcessResponse::invalid(err.to_string()),
        }
    }
}

struct Harness {
    store: Arc<ChainStore>,
    cache: Arc<BlockCache>,
    manager: Arc<ContextManager>,
    registry: Arc<ProcessorRegistry>,
    controller: ChainController,
    signer: PrivateKey,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ChainStore::open(dir.path()).unwrap());
    let cache = Arc::new(BlockCache::new(store.clone(), 32));
    let manager = Arc::new(ContextManager::new(Arc::new(store.node_store())));
    let registry = Arc::new(ProcessorRegistry::new());
    registry
        .register(
            "counter",
            "1.0",
            vec![],
            4,
            None,
            Arc::new(CounterProcessor {
                manager: manager.clone(),
            }),
        )
        .unwrap();
    registry
        .register(
            "sawtooth_settings",
            "1.0",
            vec!["000000".to_string()],
            1,
            None,
            Arc::new(SettingsProcessor {
                manager: manager.clone(),
            }),
        )
        .unwrap();
    registry
        .register(
            "block_info",
            "1.0",
            vec![],
            1,
            None,
            Arc::new(CounterProcessor {
                manager: manager.clone(),
            }),
        )
        .unwrap();

    let consensus = ConsensusRegistry::with_devmode().resolve(None, None);
    let validator = Arc::new(BlockValidator::new(
        manager.clone(),
        registry.clone(),
        consensus,
        SchedulerKind::Parallel,
        ExecutorConfig::default(),
    ));
    let controller = ChainController::new(
        store.clone(),
        cache.clone(),
        validator,
        ChainControllerConfig {
            validation_pool_size: 1,
            ..Default::default()
        },
    );
    Harness {
        store,
        cache,
        manager,
        registry,
        controller,
        signer: PrivateKey::generate(),
        _dir: dir,
    }
}

fn counter_batch(signer: &PrivateKey, op: &str, seed: u8) -> Batch {
    counter_batch_family(signer, op, seed, "counter")
}

fn counter_batch_family(signer: &PrivateKey, op: &str, seed: u8, family: &str) -> Batch {
    // `set` writes 1; `inc` bumps whatever is there.
    let payload = match op {
        "set" => format!("set {seed} 1"),
        other => format!("{other} {seed}"),
    };
    let txn = TransactionBuilder::new(family, "1.0")
        .inputs(vec![addr(seed).to_string()])
        .outputs(vec![addr(seed).to_string()])
        .payload(payload.into_bytes())
        .build(signer, &signer.public_key())
        .unwrap();
    BatchBuilder::new(vec![txn]).build(signer).unwrap()
}

fn settings_batch(signer: &PrivateKey, key: &str, value: &str) -> Batch {
    let txn = TransactionBuilder::new("sawtooth_settings", "1.0")
        .inputs(vec![setting_address(key).to_string()])
        .outputs(vec![setting_address(key).to_string()])
        .payload(format!("{key}\n{value}").into_bytes())
        .build(signer, &signer.public_key())
        .unwrap();
    BatchBuilder::new(vec![txn]).build(signer).unwrap()
}

/// Executes `batches` over `previous` state speculatively and assembles a
/// signed block with the resulting state root.
fn build_block(harness: &Harness, previous: &Block, batches: Vec<Batch>) -> Block {
    let previous_header = previous.header().unwrap();
    let scheduler = Scheduler::new(
        SchedulerKind::Serial,
        harness.manager.clone(),
        &previous_header.state_root_hash,
        true,
    );
    for batch in &batches {
        scheduler.add_batch(batch.clone(), None).unwrap();
    }
    scheduler.finalize().unwrap();
    let executor = TransactionExecutor::new(
        harness.registry.clone(),
        harness.manager.clone(),
        ExecutorConfig::default(),
    );
    executor.execute(&scheduler);
    assert!(scheduler.complete(false));
    let state_root = scheduler.final_state_hash().unwrap();
    scheduler.cancel();

    BlockBuilder::new(previous_header.block_num + 1, previous.id())
        .state_root_hash(state_root)
        .consensus(DEVMODE_PAYLOAD.to_vec())
        .batches(batches)
        .build(&harness.signer)
        .unwrap()
}

fn run_genesis(harness: &Harness, batches: &[Batch]) -> Block {
    std::fs::write(
        harness.store.data_dir().join(sawtooth_journal::GENESIS_FILE),
        sawtooth_journal::genesis_file_bytes(batches).unwrap(),
    )
    .unwrap();
    let genesis = GenesisController::new(
        harness.store.clone(),
        harness.manager.clone(),
        harness.registry.clone(),
        PrivateKey::generate(),
        ExecutorConfig::default(),
    );
    assert!(genesis.requires_genesis().unwrap());
    let block = genesis.run().unwrap();
    assert!(!genesis.requires_genesis().unwrap());
    block
}

fn state_value(harness: &Harness, seed: u8) -> Option<Vec<u8>> {
    let head = harness.store.chain_head().unwrap().unwrap();
    let root = head.header().unwrap().state_root_hash;
    let tree = MerkleRadixTree::new(Arc::new(harness.store.node_store()), Some(&root)).unwrap();
    tree.get(&addr(seed)).unwrap()
}

#[test]
fn genesis_then_commit_a_block() {
    let harness = harness();
    let signer = harness.signer.clone();
    let genesis = run_genesis(&harness, &[counter_batch(&signer, "set", 10)]);

    // Genesis invariants: number 0, empty consensus, chain id written.
    let header = genesis.header().unwrap();
    assert_eq!(header.block_num, 0);
    assert!(header.consensus.is_empty());
    assert_eq!(
        harness.store.chain_id().unwrap().as_deref(),
        Some(genesis.id())
    );
    assert_some_eq!(state_value(&harness, 10), vec![1u8]);

    let child = build_block(&harness, &genesis, vec![counter_batch(&signer, "inc", 10)]);
    harness.controller.on_block_received(child.clone());
    harness.controller.join();

    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(child.id())
    );
    assert_some_eq!(state_value(&harness, 10), vec![2u8]);
    assert!(!harness.controller.has_fatal_error());
}

#[test]
fn longer_fork_wins_and_switch_is_atomic() {
    let harness = harness();
    let signer = harness.signer.clone();
    let genesis = run_genesis(&harness, &[counter_batch(&signer, "set", 1)]);

    // Current chain: one block setting counter 2.
    let current = build_block(&harness, &genesis, vec![counter_batch(&signer, "set", 2)]);
    harness.controller.on_block_received(current.clone());
    harness.controller.join();
    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(current.id())
    );

    // Competing fork from genesis with two blocks touching counter 3.
    let fork_one = build_block(&harness, &genesis, vec![counter_batch(&signer, "set", 3)]);
    let fork_two = build_block(&harness, &fork_one, vec![counter_batch(&signer, "inc", 3)]);
    harness.controller.on_block_received(fork_one.clone());
    harness.controller.on_block_received(fork_two.clone());
    harness.controller.join();

    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(fork_two.id())
    );
    // The decommitted block's batch left the indexes; the fork's state is
    // in effect.
    assert!(!harness.store.has_batch(current.batches[0].id()).unwrap());
    assert_some_eq!(state_value(&harness, 3), vec![2u8]);
    assert_eq!(state_value(&harness, 2), None);
    assert_ok!(harness.store.check_integrity());
    assert!(!harness.controller.has_fatal_error());
}

#[test]
fn xaty_rule_invalidates_misplaced_transactions() {
    let harness = harness();
    let signer = harness.signer.clone();
    let genesis = run_genesis(
        &harness,
        &[settings_batch(
            &signer,
            "sawtooth.validator.block_validation_rules",
            "XatY:block_info,0",
        )],
    );

    // Transaction 0 is of family `counter`, not `block_info`: invalid.
    let bad = build_block(&harness, &genesis, vec![counter_batch(&signer, "set", 5)]);
    harness.controller.on_block_received(bad.clone());
    harness.controller.join();
    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(genesis.id())
    );

    // The pipeline keeps going: a conforming block commits.
    let good = build_block(
        &harness,
        &genesis,
        vec![counter_batch_family(&signer, "set", 6, "block_info")],
    );
    harness.controller.on_block_received(good.clone());
    harness.controller.join();
    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(good.id())
    );
}

#[test]
fn duplicate_batch_blocks_are_rejected() {
    let harness = harness();
    let signer = harness.signer.clone();
    let genesis = run_genesis(&harness, &[counter_batch(&signer, "set", 1)]);

    let batch = counter_batch(&signer, "set", 4);
    let first = build_block(&harness, &genesis, vec![batch.clone()]);
    harness.controller.on_block_received(first.clone());
    harness.controller.join();
    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(first.id())
    );

    // The same batch again in a child block is a duplicate.
    let duplicate = build_block(&harness, &first, vec![batch]);
    harness.controller.on_block_received(duplicate);
    harness.controller.join();
    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(first.id())
    );
}

struct ControllerBroadcaster {
    controller: ChainController,
    published: Mutex<Vec<String>>,
}

impl BlockBroadcaster for ControllerBroadcaster {
    fn broadcast_block(&self, block: Block) {
        self.published.lock().push(block.id().to_string());
        self.controller.on_block_received(block);
    }
}

#[test]
fn publisher_builds_and_publishes_from_pending_batches() {
    let harness = harness();
    let signer = harness.signer.clone();
    let genesis = run_genesis(&harness, &[counter_batch(&signer, "set", 1)]);

    let consensus = ConsensusRegistry::with_devmode().resolve(None, None);
    let publisher = BlockPublisher::new(
        harness.manager.clone(),
        harness.registry.clone(),
        consensus,
        Arc::new(InjectorRegistry::new()),
        harness.cache.clone(),
        harness.signer.clone(),
        PublisherConfig {
            scheduler_kind: SchedulerKind::Parallel,
            executor_config: ExecutorConfig::default(),
            tick: Duration::from_millis(20),
        },
    );
    let broadcaster = Arc::new(ControllerBroadcaster {
        controller: harness.controller.clone(),
        published: Mutex::new(Vec::new()),
    });
    publisher.set_broadcaster(broadcaster.clone());

    publisher.on_batch_received(counter_batch(&signer, "inc", 1));
    publisher.start_block(&genesis).unwrap();
    assert!(publisher.check_publish());
    let block = publisher.finalize_block().unwrap();

    harness.controller.join();
    assert_eq!(*broadcaster.published.lock(), vec![block.id().to_string()]);
    assert_eq!(
        harness.store.chain_head_id().unwrap().as_deref(),
        Some(block.id())
    );
    assert_some_eq!(state_value(&harness, 1), vec![2u8]);
}
