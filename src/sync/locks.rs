// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Named locks that keep two syncs of one application from overlapping.

use crate::error::{DriftwoodError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct SyncLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Releases its lock when dropped
#[derive(Debug)]
pub struct SyncGuard {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for an application, failing if a sync already holds it
    pub fn try_acquire(&self, name: &str) -> Result<SyncGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| DriftwoodError::SyncInProgress(name.to_string()))?;
        if !held.insert(name.to_string()) {
            return Err(DriftwoodError::SyncInProgress(name.to_string()));
        }
        Ok(SyncGuard {
            name: name.to_string(),
            held: self.held.clone(),
        })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.name);
        }
    }
}
