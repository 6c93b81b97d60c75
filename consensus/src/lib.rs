// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! The consensus plug-in surface.
//!
//! Concrete algorithms live out of tree; the core needs three capabilities:
//! driving block publication, verifying a block's consensus payload, and
//! choosing between competing forks. Engines are selected by name and
//! version from the on-chain settings at genesis; the built-in dev-mode
//! engine keeps a single-node network (and the test suite) running without
//! an external plug-in.

use parking_lot::RwLock;
use sawtooth_types::{Block, BlockHeader};
use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("consensus rejected the operation: {0}")]
    Rejected(String),
    #[error("block failed consensus verification: {0}")]
    InvalidBlock(String),
    #[error("consensus internal error: {0}")]
    Internal(String),
}

/// Read-only block access granted to consensus engines.
pub trait ConsensusBlockReader: Send + Sync {
    fn chain_head(&self) -> Option<Block>;
    fn get_block(&self, block_id: &str) -> Option<Block>;
}

/// Publisher-side hooks, called while a candidate block is being built.
pub trait ConsensusPublisher: Send + Sync {
    /// Consensus may reject building on this predecessor.
    fn initialize_block(&self, previous: &BlockHeader) -> Result<(), ConsensusError>;

    /// Whether the in-progress block should be published now.
    fn check_publish_block(&self, candidate: &BlockHeader) -> bool;

    /// Produces the consensus payload for the finished header.
    fn finalize_block(&self, candidate: &BlockHeader) -> Result<Vec<u8>, ConsensusError>;
}

/// Validation-side hook.
pub trait ConsensusVerifier: Send + Sync {
    fn verify_block(&self, block: &Block) -> Result<(), ConsensusError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkDecision {
    KeepCurrent,
    SwitchToCandidate,
}

/// Chooses between the current chain and a candidate fork. Both chains are
/// given from the first block after the common ancestor to the tip,
/// ascending.
pub trait ConsensusForkResolver: Send + Sync {
    fn compare_forks(&self, current: &[Block], candidate: &[Block]) -> ForkDecision;
}

/// One consensus algorithm: its three capabilities under one name/version.
pub struct ConsensusEngine {
    pub name: String,
    pub version: String,
    pub publisher: Arc<dyn ConsensusPublisher>,
    pub verifier: Arc<dyn ConsensusVerifier>,
    pub fork_resolver: Arc<dyn ConsensusForkResolver>,
}

/// Engines known to this validator, selectable by on-chain setting.
#[derive(Default)]
pub struct ConsensusRegistry {
    engines: RwLock<HashMap<(String, String), Arc<ConsensusEngine>>>,
}

impl ConsensusRegistry {
    /// A registry with the dev-mode engine pre-registered.
    pub fn with_devmode() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(DevModeEngine::engine(Duration::ZERO)));
        registry
    }

    pub fn register(&self, engine: Arc<ConsensusEngine>) {
        self.engines
            .write()
            .insert((engine.name.clone(), engine.version.clone()), engine);
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<ConsensusEngine>> {
        self.engines
            .read()
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }

    /// Resolves the engine the on-chain settings ask for, defaulting to
    /// dev-mode when the settings are unset or name an unknown engine.
    pub fn resolve(&self, name: Option<&str>, version: Option<&str>) -> Arc<ConsensusEngine> {
        let name = name.unwrap_or(DEVMODE_NAME);
        let version = version.unwrap_or(DEVMODE_VERSION);
        if let Some(engine) = self.get(name, version) {
            return engine;
        }
        debug!(name, version, "unknown consensus engine, falling back to dev-mode");
        self.get(DEVMODE_NAME, DEVMODE_VERSION)
            .expect("dev-mode engine is always registered")
    }
}

pub const DEVMODE_NAME: &str = "Devmode";
pub const DEVMODE_VERSION: &str = "0.1";
const DEVMODE_PAYLOAD: &[u8] = b"Devmode";

/// Single-node development consensus: publish whenever the configured wait
/// has elapsed, accept any well-formed payload, prefer the longer fork.
pub struct DevModeEngine {
    min_wait: Duration,
    initialized_at: RwLock<Option<Instant>>,
}

impl DevModeEngine {
    pub fn engine(min_wait: Duration) -> ConsensusEngine {
        let inner = Arc::new(DevModeEngine {
            min_wait,
            initialized_at: RwLock::new(None),
        });
        ConsensusEngine {
            name: DEVMODE_NAME.to_string(),
            version: DEVMODE_VERSION.to_string(),
            publisher: inner.clone(),
            verifier: inner.clone(),
            fork_resolver: inner,
        }
    }
}

impl ConsensusPublisher for DevModeEngine {
    fn initialize_block(&self, _previous: &BlockHeader) -> Result<(), ConsensusError> {
        *self.initialized_at.write() = Some(Instant::now());
        Ok(())
    }

    fn check_publish_block(&self, _candidate: &BlockHeader) -> bool {
        let initialized_at = *self.initialized_at.read();
        initialized_at
            .map(|started| started.elapsed() >= self.min_wait)
            .unwrap_or(false)
    }

    fn finalize_block(&self, _candidate: &BlockHeader) -> Result<Vec<u8>, ConsensusError> {
        Ok(DEVMODE_PAYLOAD.to_vec())
    }
}

impl ConsensusVerifier for DevModeEngine {
    fn verify_block(&self, block: &Block) -> Result<(), ConsensusError> {
        let header = block
            .header()
            .map_err(|e| ConsensusError::Internal(e.to_string()))?;
        // Genesis carries empty consensus bytes.
        if header.consensus.is_empty() && header.is_genesis() {
            return Ok(());
        }
        if header.consensus != DEVMODE_PAYLOAD {
            return Err(ConsensusError::InvalidBlock(format!(
                "unexpected consensus payload on block {}",
                block.id()
            )));
        }
        Ok(())
    }
}

impl ConsensusForkResolver for DevModeEngine {
    fn compare_forks(&self, current: &[Block], candidate: &[Block]) -> ForkDecision {
        // Longest chain wins; equal length falls back to the lexicographically
        // smaller tip id so every node picks the same side.
        if candidate.len() > current.len() {
            return ForkDecision::SwitchToCandidate;
        }
        if candidate.len() == current.len() {
            let candidate_tip = candidate.last().map(|b| b.id());
            let current_tip = current.last().map(|b| b.id());
            if let (Some(candidate_tip), Some(current_tip)) = (candidate_tip, current_tip) {
                if candidate_tip < current_tip {
                    return ForkDecision::SwitchToCandidate;
                }
            }
        }
        ForkDecision::KeepCurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_ok, assert_some};
    use sawtooth_crypto::PrivateKey;
    use sawtooth_types::{BlockBuilder, NULL_BLOCK_IDENTIFIER};

    fn block(num: u64, previous: &str, consensus: &[u8]) -> Block {
        let signer = PrivateKey::generate();
        BlockBuilder::new(num, previous)
            .state_root_hash("00".repeat(32))
            .consensus(consensus.to_vec())
            .build(&signer)
            .unwrap()
    }

    #[test]
    fn registry_resolves_and_falls_back() {
        let registry = ConsensusRegistry::with_devmode();
        assert_some!(registry.get(DEVMODE_NAME, DEVMODE_VERSION));
        let engine = registry.resolve(Some("pbft"), Some("1.0"));
        assert_eq!(engine.name, DEVMODE_NAME);
        let engine = registry.resolve(None, None);
        assert_eq!(engine.name, DEVMODE_NAME);
    }

    #[test]
    fn devmode_publishes_after_wait() {
        let engine = DevModeEngine::engine(Duration::ZERO);
        let header = BlockHeader::default();
        // Not publishable before initialize.
        assert!(!engine.publisher.check_publish_block(&header));
        assert_ok!(engine.publisher.initialize_block(&header));
        assert!(engine.publisher.check_publish_block(&header));
        let payload = engine.publisher.finalize_block(&header).unwrap();
        assert_eq!(payload, DEVMODE_PAYLOAD);
    }

    #[test]
    fn devmode_verifies_payloads() {
        let engine = DevModeEngine::engine(Duration::ZERO);
        let genesis = block(0, NULL_BLOCK_IDENTIFIER, b"");
        assert_ok!(engine.verifier.verify_block(&genesis));
        let good = block(1, genesis.id(), DEVMODE_PAYLOAD);
        assert_ok!(engine.verifier.verify_block(&good));
        let bad = block(1, genesis.id(), b"other");
        assert!(engine.verifier.verify_block(&bad).is_err());
    }

    #[test]
    fn fork_resolution_prefers_longer_then_smaller_tip() {
        let engine = DevModeEngine::engine(Duration::ZERO);
        let genesis = block(0, NULL_BLOCK_IDENTIFIER, b"");
        let a = block(1, genesis.id(), DEVMODE_PAYLOAD);
        let b1 = block(1, genesis.id(), DEVMODE_PAYLOAD);
        let b2 = block(2, b1.id(), DEVMODE_PAYLOAD);

        assert_eq!(
            engine
                .fork_resolver
                .compare_forks(&[a.clone()], &[b1.clone(), b2.clone()]),
            ForkDecision::SwitchToCandidate
        );
        assert_eq!(
            engine
                .fork_resolver
                .compare_forks(&[b1.clone(), b2.clone()], &[a.clone()]),
            ForkDecision::KeepCurrent
        );

        let expected = if b1.id() < a.id() {
            ForkDecision::SwitchToCandidate
        } else {
            ForkDecision::KeepCurrent
        };
        assert_eq!(
            engine.fork_resolver.compare_forks(&[a.clone()], &[b1.clone()]),
            expected
        );
    }
}
