// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios over a full validator: genesis bootstrap, batch
//! submission through the publisher, receipts, and event replay.

use claims::{assert_ok, assert_some};
use sawtooth_crypto::{sha512_hex, PrivateKey};
use sawtooth_events::{EventSubscription, BLOCK_COMMIT_EVENT_TYPE};
use sawtooth_executor::{TpProcessRequest, TpProcessResponse, TransactionProcessor};
use sawtooth_state::ContextManager;
use sawtooth_types::{Address, Batch, BatchBuilder, TransactionBuilder};
use sawtooth_validator::{ValidatorBuilder, ValidatorConfig};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

const INTKEY_FAMILY: &str = "intkey";

fn intkey_namespace() -> String {
    sha512_hex(INTKEY_FAMILY.as_bytes())[..6].to_string()
}

fn intkey_address(name: &str) -> Address {
    let namespace = intkey_namespace();
    let suffix = &sha512_hex(name.as_bytes())[..64];
    Address::new(format!("{namespace}{suffix}")).unwrap()
}

/// `set <name> <value>` / `inc <name>`, storing single-byte values.
struct IntkeyProcessor {
    manager: Arc<ContextManager>,
}

impl TransactionProcessor for IntkeyProcessor {
    fn process(&self, request: TpProcessRequest) -> TpProcessResponse {
        let payload = String::from_utf8(request.payload.clone()).unwrap_or_default();
        let parts: Vec<&str> = payload.split_whitespace().collect();
        let result = match parts.as_slice() {
            ["set", name, value] => {
                let Ok(value) = value.parse::<u8>() else {
                    return TpProcessResponse::invalid("bad value");
                };
                self.manager
                    .set(&request.context_id, vec![(intkey_address(name), vec![value])])
            }
            ["inc", name] => {
                let address = intkey_address(name);
                let current = match self.manager.get(&request.context_id, &[address.clone()]) {
                    Ok(values) => values[0].clone(),
                    Err(err) => return TpProcessResponse::invalid(err.to_string()),
                };
                let Some(current) = current else {
                    return TpProcessResponse::invalid("unset key");
                };
                self.manager
                    .set(&request.context_id, vec![(address, vec![current[0] + 1])])
            }
            _ => return TpProcessResponse::invalid("unknown op"),
        };
        match result {
            Ok(()) => TpProcessResponse::ok(),
            Err(err) => TpProcessResponse::invalid(err.to_string()),
        }
    }
}

fn intkey_batch(signer: &PrivateKey, name: &str, payload: &str) -> Batch {
    let address = intkey_address(name).to_string();
    let txn = TransactionBuilder::new(INTKEY_FAMILY, "1.0")
        .inputs(vec![address.clone()])
        .outputs(vec![address])
        .payload(payload.as_bytes().to_vec())
        .build(signer, &signer.public_key())
        .unwrap();
    BatchBuilder::new(vec![txn]).build(signer).unwrap()
}

fn validator_with_genesis(
    dir: &tempfile::TempDir,
    genesis_batches: &[Batch],
) -> sawtooth_validator::Validator {
    sawtooth_validator::init_logging();
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(
        dir.path().join(sawtooth_journal::GENESIS_FILE),
        sawtooth_journal::genesis_file_bytes(genesis_batches).unwrap(),
    )
    .unwrap();
    ValidatorBuilder::new(ValidatorConfig::new(dir.path()))
        .with_processor(INTKEY_FAMILY, "1.0", vec![intkey_namespace()], 4, None, |manager| {
            Arc::new(IntkeyProcessor { manager }) as Arc<dyn TransactionProcessor>
        })
        .build()
        .unwrap()
}

fn wait_for_block_num(validator: &sawtooth_validator::Validator, num: u64) -> sawtooth_types::Block {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Ok(Some(head)) = validator.chain_head() {
            if head.header().unwrap().block_num >= num {
                return head;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for block {num}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn genesis_produces_block_zero_and_initial_state() {
    let dir = tempfile::tempdir().unwrap();
    let signer = PrivateKey::generate();
    let validator = validator_with_genesis(&dir, &[intkey_batch(&signer, "k", "set k 10")]);

    let head = assert_some!(validator.chain_head().unwrap());
    let header = head.header().unwrap();
    assert_eq!(header.block_num, 0);
    assert!(header.consensus.is_empty());

    // block-chain-id carries the genesis signature.
    assert_eq!(
        validator.store().chain_id().unwrap().as_deref(),
        Some(head.id())
    );

    // State at the intkey address holds the serialized value.
    let value = assert_some!(validator.get_state(&intkey_address("k")).unwrap());
    assert_eq!(value, vec![10u8]);
    assert!(!validator.has_fatal_error());
}

#[test]
fn submitted_batches_are_published_and_receipted() {
    let dir = tempfile::tempdir().unwrap();
    let signer = PrivateKey::generate();
    let mut validator = validator_with_genesis(&dir, &[intkey_batch(&signer, "k", "set k 10")]);
    validator.start().unwrap();

    let batch = intkey_batch(&signer, "k", "inc k");
    let txn_id = batch.transactions[0].id().to_string();
    validator.submit_batch(batch);

    let head = wait_for_block_num(&validator, 1);
    assert_eq!(
        validator.get_state(&intkey_address("k")).unwrap(),
        Some(vec![11u8])
    );
    assert_some!(validator.get_block(head.id()).unwrap());

    // The receipt for the committed transaction is queryable and records
    // the state change.
    let receipt = assert_some!(validator.get_receipt(&txn_id).unwrap());
    assert_eq!(receipt.transaction_id, txn_id);
    assert_eq!(receipt.state_changes.len(), 1);

    validator.stop();
}

#[test]
fn event_replay_precedes_live_events() {
    let dir = tempfile::tempdir().unwrap();
    let signer = PrivateKey::generate();
    let mut validator = validator_with_genesis(&dir, &[intkey_batch(&signer, "k", "set k 1")]);
    validator.start().unwrap();

    // Build some history.
    validator.submit_batch(intkey_batch(&signer, "k", "inc k"));
    let block_one = wait_for_block_num(&validator, 1);
    let genesis = validator.store().get_block_by_number(0).unwrap().unwrap();

    // Subscriber last saw genesis: block 1 must be replayed first.
    let subscription = EventSubscription {
        event_type: BLOCK_COMMIT_EVENT_TYPE.to_string(),
        filters: vec![],
    };
    let mut receiver = validator
        .subscribe_events(&[subscription], &[genesis.id().to_string()])
        .unwrap();

    let replayed = receiver.try_recv().expect("replayed block-commit event");
    assert_eq!(replayed.block_id, block_one.id());
    assert_eq!(replayed.block_num, 1);

    // New commits arrive after the replay, in order.
    validator.submit_batch(intkey_batch(&signer, "k", "inc k"));
    let block_two = wait_for_block_num(&validator, 2);
    let deadline = Instant::now() + Duration::from_secs(10);
    let live = loop {
        match receiver.try_recv() {
            Ok(list) => break list,
            Err(_) => {
                assert!(Instant::now() < deadline, "timed out waiting for live event");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };
    assert_eq!(live.block_id, block_two.id());
    assert_eq!(live.block_num, 2);

    // An unknown anchor is refused.
    let subscription = EventSubscription {
        event_type: BLOCK_COMMIT_EVENT_TYPE.to_string(),
        filters: vec![],
    };
    assert!(validator
        .subscribe_events(&[subscription], &["unknown-block".to_string()])
        .is_err());

    validator.stop();
}

#[test]
fn restart_preserves_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let signer = PrivateKey::generate();
    let head_id = {
        let mut validator =
            validator_with_genesis(&dir, &[intkey_batch(&signer, "k", "set k 5")]);
        validator.start().unwrap();
        validator.submit_batch(intkey_batch(&signer, "k", "inc k"));
        let head = wait_for_block_num(&validator, 1);
        validator.stop();
        head.id().to_string()
    };

    // Rebuilding over the same data dir does not rerun genesis and sees
    // the same head.
    let validator = ValidatorBuilder::new(ValidatorConfig::new(dir.path()))
        .with_processor(INTKEY_FAMILY, "1.0", vec![intkey_namespace()], 4, None, |manager| {
            Arc::new(IntkeyProcessor { manager }) as Arc<dyn TransactionProcessor>
        })
        .build()
        .unwrap();
    let head = assert_some!(validator.chain_head().unwrap());
    assert_eq!(head.id(), head_id);
    assert_ok!(validator.store().check_integrity());
    assert_eq!(
        validator.get_state(&intkey_address("k")).unwrap(),
        Some(vec![6u8])
    );
}
