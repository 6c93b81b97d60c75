// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use sawtooth_types::{Address, Event, StateChange};
use std::collections::HashMap;

pub type ContextId = String;

/// The working overlay of one in-flight transaction: its declared address
/// sets, its writes (with tombstones for deletes), emitted events and opaque
/// receipt data, plus the contexts it reads through.
pub struct Context {
    pub(crate) base_contexts: Vec<ContextId>,
    pub(crate) state_root: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    /// Current value per written address; `None` is a tombstone.
    writes: HashMap<Address, Option<Vec<u8>>>,
    /// First-write order of `writes`, for receipt reporting.
    write_order: Vec<Address>,
    events: Vec<Event>,
    data: Vec<Vec<u8>>,
}

impl Context {
    pub(crate) fn new(
        state_root: String,
        base_contexts: Vec<ContextId>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            base_contexts,
            state_root,
            inputs,
            outputs,
            writes: HashMap::new(),
            write_order: Vec::new(),
            events: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn is_readable(&self, address: &Address) -> bool {
        self.inputs.iter().any(|prefix| address.matches_prefix(prefix))
    }

    pub fn is_writable(&self, address: &Address) -> bool {
        self.outputs.iter().any(|prefix| address.matches_prefix(prefix))
    }

    pub(crate) fn put(&mut self, address: Address, value: Option<Vec<u8>>) {
        if !self.writes.contains_key(&address) {
            self.write_order.push(address.clone());
        }
        self.writes.insert(address, value);
    }

    /// The overlay entry for `address`: `Some(None)` is a tombstone,
    /// `None` means this context never wrote it.
    pub(crate) fn written(&self, address: &Address) -> Option<&Option<Vec<u8>>> {
        self.writes.get(address)
    }

    pub(crate) fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn add_data(&mut self, data: Vec<u8>) {
        self.data.push(data);
    }

    /// Final state changes in first-write order.
    pub fn state_changes(&self) -> Vec<StateChange> {
        self.write_order
            .iter()
            .map(|address| match &self.writes[address] {
                Some(value) => StateChange::Set {
                    address: address.clone(),
                    value: value.clone(),
                },
                None => StateChange::Delete {
                    address: address.clone(),
                },
            })
            .collect()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn data(&self) -> &[Vec<u8>] {
        &self.data
    }
}
