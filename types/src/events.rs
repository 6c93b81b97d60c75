// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// A key/value pair attached to an event. Order is preserved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

impl EventAttribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An event emitted during transaction execution or by the core itself
/// (`sawtooth/block-commit`, `sawtooth/state-delta`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub attributes: Vec<EventAttribute>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, attributes: Vec<EventAttribute>, data: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            attributes,
            data,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }
}
