// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use sawtooth_types::{Block, Event, EventAttribute, StateChange, TransactionReceipt};
use tracing::warn;

pub const BLOCK_COMMIT_EVENT_TYPE: &str = "sawtooth/block-commit";
pub const STATE_DELTA_EVENT_TYPE: &str = "sawtooth/state-delta";

/// Everything a committed block produces, in a fixed order: the
/// block-commit event, the aggregated state-delta event, then the
/// family-defined events in receipt order.
pub fn extract_block_events(block: &Block, receipts: &[TransactionReceipt]) -> Vec<Event> {
    let mut events = Vec::new();

    match block.header() {
        Ok(header) => {
            events.push(Event::new(
                BLOCK_COMMIT_EVENT_TYPE,
                vec![
                    EventAttribute::new("block_id", block.id()),
                    EventAttribute::new("block_num", header.block_num.to_string()),
                    EventAttribute::new("state_root_hash", header.state_root_hash.clone()),
                    EventAttribute::new("previous_block_id", header.previous_block_id.clone()),
                ],
                Vec::new(),
            ));
        }
        Err(err) => {
            warn!(block = %block.id(), error = %err, "committed block header failed to parse");
        }
    }

    let state_changes: Vec<StateChange> = receipts
        .iter()
        .flat_map(|receipt| receipt.state_changes.iter().cloned())
        .collect();
    if !state_changes.is_empty() {
        let attributes = state_changes
            .iter()
            .map(|change| EventAttribute::new("address", change.address().to_string()))
            .collect();
        let data = bcs::to_bytes(&state_changes).unwrap_or_default();
        events.push(Event::new(STATE_DELTA_EVENT_TYPE, attributes, data));
    }

    for receipt in receipts {
        events.extend(receipt.events.iter().cloned());
    }
    events
}
