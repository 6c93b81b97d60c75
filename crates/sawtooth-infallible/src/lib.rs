// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lock wrappers that treat poisoning as a bug rather than a recoverable
//! error, plus a small wall-clock helper shared by the journal and network
//! components.

use std::{
    sync::{Mutex as StdMutex, MutexGuard, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A Mutex that panics on poisoning. A poisoned lock means another thread
/// already panicked while holding it; continuing is never sound.
#[derive(Debug, Default)]
pub struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self(StdMutex::new(value))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0
            .lock()
            .expect("sawtooth-infallible Mutex: lock poisoned")
    }

    pub fn into_inner(self) -> T {
        self.0
            .into_inner()
            .expect("sawtooth-infallible Mutex: lock poisoned")
    }
}

/// An RwLock that panics on poisoning.
#[derive(Debug, Default)]
pub struct RwLock<T>(StdRwLock<T>);

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self(StdRwLock::new(value))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0
            .read()
            .expect("sawtooth-infallible RwLock: lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0
            .write()
            .expect("sawtooth-infallible RwLock: lock poisoned")
    }
}

/// Duration since the unix epoch. The system clock predating the epoch is
/// treated as a configuration bug.
pub fn duration_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch")
}
