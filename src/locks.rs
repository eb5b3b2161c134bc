// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A panicking metrics consumer or test closure must not take the loader's
//! shared bookkeeping down with it. These helpers log the poisoning and hand
//! back the guard so callers keep running on the last written data.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "ranker_loader::locks",
            event = "LOCK_POISONED_READ",
            "RwLock poisoned during read; recovering last written data"
        );
        poisoned.into_inner()
    })
}

/// Acquire a write lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "ranker_loader::locks",
            event = "LOCK_POISONED_WRITE",
            "RwLock poisoned during write; recovering last written data"
        );
        poisoned.into_inner()
    })
}
