//! Presentation-layer query cache.
//!
//! Holds the JSON results the dashboard renders (transaction lists, account
//! balances, summary cards). A finished import invalidates the affected keys;
//! the next render refetches them.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::debug;

use pocketledger_imports::{CacheInvalidator, CacheKey, CacheKeySet};

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Value>,
    /// Bumped on every invalidation of the key, cached or not.
    generations: HashMap<CacheKey, u64>,
    invalidations: u64,
}

/// Thread-safe in-memory query cache.
#[derive(Debug, Default)]
pub struct QueryCache {
    state: RwLock<CacheState>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let state = self.state.read().ok()?;
        state.entries.get(key).cloned()
    }

    pub fn put(&self, key: CacheKey, value: Value) {
        if let Ok(mut state) = self.state.write() {
            state.entries.insert(key, value);
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// How many times `key` has been invalidated.
    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.state
            .read()
            .ok()
            .and_then(|state| state.generations.get(key).copied())
            .unwrap_or(0)
    }

    /// Invalidation calls received so far.
    pub fn invalidations(&self) -> u64 {
        self.state.read().map(|state| state.invalidations).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInvalidator for QueryCache {
    fn invalidate(&self, keys: &CacheKeySet) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.invalidations += 1;
        let mut dropped = 0usize;
        for key in keys {
            if state.entries.remove(key).is_some() {
                dropped += 1;
            }
            *state.generations.entry(*key).or_insert(0) += 1;
        }
        debug!(keys = keys.len(), dropped, "query cache invalidated");
    }
}
