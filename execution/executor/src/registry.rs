// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transaction-processor registrations.
//!
//! A processor registers a family name and version, the namespaces it will
//! touch, and the number of requests it is willing to hold in flight; the
//! executor honors that occupancy cap with a counting guard.

use crate::TransactionProcessor;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("processor for {family} {version} is already registered")]
    AlreadyRegistered { family: String, version: String },
    #[error("max_occupancy must be at least 1")]
    ZeroOccupancy,
}

#[derive(Clone)]
pub struct ProcessorEntry {
    pub processor: Arc<dyn TransactionProcessor>,
    pub namespaces: Vec<String>,
    pub occupancy: Arc<Occupancy>,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<(String, String), ProcessorEntry>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        family: &str,
        version: &str,
        namespaces: Vec<String>,
        max_occupancy: usize,
        timeout: Option<Duration>,
        processor: Arc<dyn TransactionProcessor>,
    ) -> Result<(), RegistryError> {
        if max_occupancy == 0 {
            return Err(RegistryError::ZeroOccupancy);
        }
        let key = (family.to_string(), version.to_string());
        let mut processors = self.processors.write();
        if processors.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                family: family.to_string(),
                version: version.to_string(),
            });
        }
        info!(family, version, max_occupancy, "processor registered");
        processors.insert(
            key,
            ProcessorEntry {
                processor,
                namespaces,
                occupancy: Arc::new(Occupancy::new(max_occupancy)),
                timeout,
            },
        );
        Ok(())
    }

    pub fn deregister(&self, family: &str, version: &str) {
        let removed = self
            .processors
            .write()
            .remove(&(family.to_string(), version.to_string()));
        if removed.is_some() {
            info!(family, version, "processor deregistered");
        }
    }

    pub fn get(&self, family: &str, version: &str) -> Option<ProcessorEntry> {
        self.processors
            .read()
            .get(&(family.to_string(), version.to_string()))
            .cloned()
    }

    pub fn is_registered(&self, family: &str, version: &str) -> bool {
        self.processors
            .read()
            .contains_key(&(family.to_string(), version.to_string()))
    }
}

/// A counting guard: at most `cap` holders at a time; `acquire` blocks.
pub struct Occupancy {
    cap: usize,
    in_use: Mutex<usize>,
    available: Condvar,
}

impl Occupancy {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            in_use: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> OccupancyGuard {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.cap {
            self.available.wait(&mut in_use);
        }
        *in_use += 1;
        OccupancyGuard {
            occupancy: self.clone(),
        }
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }
}

pub struct OccupancyGuard {
    occupancy: Arc<Occupancy>,
}

impl Drop for OccupancyGuard {
    fn drop(&mut self) {
        let mut in_use = self.occupancy.in_use.lock();
        *in_use -= 1;
        self.occupancy.available.notify_one();
    }
}
