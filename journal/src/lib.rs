// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! The journal: everything between "a block or batch arrived" and "the
//! chain head moved".
//!
//! Inbound artifacts pass through the [`Completer`], which holds them until
//! their dependencies are present. Completed batches feed the
//! [`BlockPublisher`]; completed blocks feed the [`ChainController`], which
//! validates candidate forks (in parallel, on a bounded pool) and applies
//! head switches atomically through the chain store. The
//! [`GenesisController`] produces the one block that starts a chain.

mod block_cache;
mod block_validator;
mod chain_controller;
mod completer;
mod genesis;
mod injector;
mod permission_verifier;
mod publisher;
mod validation_rules;

pub use block_cache::{BlockCache, BlockStatus};
pub use block_validator::{BlockValidator, ChainCommitState, ValidationFailure};
pub use chain_controller::{ChainController, ChainControllerConfig, ChainEvent, ChainHeadListener};
pub use completer::{
    BatchSink, BlockSink, Completer, CompleterConfig, NullRequestSender, RequestSender,
};
pub use genesis::{
    genesis_file_bytes, load_genesis_batches, GenesisController, GenesisError, GENESIS_FILE,
};
pub use injector::{BatchInjector, InjectorRegistry};
pub use permission_verifier::PermissionVerifier;
pub use publisher::{BlockBroadcaster, BlockPublisher, PublisherConfig, PublisherError};
pub use validation_rules::{enforce_validation_rules, parse_validation_rules, ValidationRule};
