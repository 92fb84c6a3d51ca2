// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A panic inside a registry mutator poisons the lock. The registry only
//! commits a mutation after the mutator returns, so the guarded data is still
//! a consistent snapshot and we keep serving it instead of taking the whole
//! service down.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "harvester::sync",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering registry data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "harvester::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering registry data"
            );
            poisoned.into_inner()
        }
    }
}
