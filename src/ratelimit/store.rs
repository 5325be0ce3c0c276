//! State store abstraction and the in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::key::StateKey;
use super::state::LimitState;
use crate::error::BackendError;

/// Storage for limit state.
///
/// `get` and `put` are independent operations; serializing a
/// read-modify-write on one key is the caller's job.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Fetch the state for a key.
    async fn get(&self, key: &StateKey) -> Result<Option<LimitState>, BackendError>;

    /// Replace the state for a key.
    async fn put(&self, key: &StateKey, state: LimitState) -> Result<(), BackendError>;

    /// Whether the backend expires entries on its own.
    ///
    /// `sweep_expired` must not be called on a self-pruning store.
    fn self_pruning(&self) -> bool;

    /// Remove every entry whose validity window has passed, returning the
    /// number removed.
    async fn sweep_expired(&self) -> Result<usize, BackendError>;
}

/// In-process state store backed by a sharded concurrent map.
///
/// Not self-pruning: expired entries stay until `sweep_expired` runs.
#[derive(Debug)]
pub struct InMemoryStateStore {
    states: DashMap<StateKey, LimitState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStateStore {
    /// Create a store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with a specific clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            states: DashMap::new(),
            clock,
        }
    }

    /// Number of stored states, expired ones included.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the store holds no state.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.states.clear();
    }

    /// Snapshot the keys expired at `now`. Removing while iterating would
    /// deadlock the shard.
    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<StateKey> {
        self.states
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove the snapshotted keys that are still expired.
    fn remove_expired(&self, keys: Vec<StateKey>, now: DateTime<Utc>) -> usize {
        keys.into_iter()
            // A caller may have refreshed the entry since the snapshot.
            .filter(|key| {
                self.states
                    .remove_if(key, |_, state| state.is_expired(now))
                    .is_some()
            })
            .count()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<LimitState>, BackendError> {
        Ok(self.states.get(key).map(|state| state.clone()))
    }

    async fn put(&self, key: &StateKey, state: LimitState) -> Result<(), BackendError> {
        self.states.insert(key.clone(), state);
        Ok(())
    }

    fn self_pruning(&self) -> bool {
        false
    }

    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        let now = self.clock.now();
        let expired = self.expired_keys(now);
        let removed = self.remove_expired(expired, now);

        trace!(removed = removed, remaining = self.states.len(), "Swept expired states");
        Ok(removed)
    }
}
