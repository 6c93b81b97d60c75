// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use sawtooth_types::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterType {
    SimpleAny,
    SimpleAll,
    RegexAny,
    RegexAll,
}

/// An uncompiled filter as a client submits it.
#[derive(Clone, Debug)]
pub struct EventFilterSpec {
    pub key: String,
    pub match_string: String,
    pub filter_type: FilterType,
}

/// A client subscription: an event type plus filters over its attributes.
#[derive(Clone, Debug)]
pub struct EventSubscription {
    pub event_type: String,
    pub filters: Vec<EventFilterSpec>,
}

pub(crate) enum CompiledMatcher {
    Simple(String),
    Regex(Regex),
}

impl CompiledMatcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            CompiledMatcher::Simple(expected) => value == expected,
            CompiledMatcher::Regex(regex) => regex.is_match(value),
        }
    }
}

pub(crate) struct CompiledFilter {
    key: String,
    matcher: CompiledMatcher,
    any: bool,
}

impl CompiledFilter {
    pub(crate) fn compile(filter: &EventFilterSpec) -> Result<Self, regex::Error> {
        let (matcher, any) = match filter.filter_type {
            FilterType::SimpleAny => (CompiledMatcher::Simple(filter.match_string.clone()), true),
            FilterType::SimpleAll => (CompiledMatcher::Simple(filter.match_string.clone()), false),
            FilterType::RegexAny => {
                (CompiledMatcher::Regex(Regex::new(&filter.match_string)?), true)
            }
            FilterType::RegexAll => {
                (CompiledMatcher::Regex(Regex::new(&filter.match_string)?), false)
            }
        };
        Ok(Self {
            key: filter.key.clone(),
            matcher,
            any,
        })
    }

    /// ANY: some attribute with the key matches. ALL: every attribute with
    /// the key matches (vacuously true when the key is absent).
    fn matches(&self, event: &Event) -> bool {
        let mut values = event
            .attributes
            .iter()
            .filter(|attr| attr.key == self.key)
            .map(|attr| attr.value.as_str());
        if self.any {
            values.any(|value| self.matcher.matches(value))
        } else {
            values.all(|value| self.matcher.matches(value))
        }
    }
}

pub(crate) struct CompiledSubscription {
    event_type: String,
    filters: Vec<CompiledFilter>,
}

impl CompiledSubscription {
    pub(crate) fn compile(subscription: &EventSubscription) -> Result<Self, regex::Error> {
        Ok(Self {
            event_type: subscription.event_type.clone(),
            filters: subscription
                .filters
                .iter()
                .map(CompiledFilter::compile)
                .collect::<Result<_, _>>()?,
        })
    }

    pub(crate) fn matches(&self, event: &Event) -> bool {
        event.event_type == self.event_type
            && self.filters.iter().all(|filter| filter.matches(event))
    }
}
