// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! The events and receipts pipeline: turns committed blocks into
//! `sawtooth/block-commit` and `sawtooth/state-delta` events (plus whatever
//! the transaction families emitted), filters them per subscription, and
//! delivers them in commit order — replaying history first for subscribers
//! that announce where they left off.

mod broadcaster;
mod extractor;
mod filter;

pub use broadcaster::{EventBroadcaster, EventBroadcasterConfig, EventList, SubscribeError};
pub use extractor::{extract_block_events, BLOCK_COMMIT_EVENT_TYPE, STATE_DELTA_EVENT_TYPE};
pub use filter::{EventFilterSpec, EventSubscription, FilterType};
