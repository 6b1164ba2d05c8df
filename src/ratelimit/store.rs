//! Storage for limiter state.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::key::LimiterKey;
use super::policy::LimiterState;
use crate::error::Result;

/// Limiter state together with the instant it stops mattering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Policy state
    pub state: LimiterState,
    /// After this instant the state is treated as absent
    pub expires_at: DateTime<Utc>,
}

impl StoredState {
    /// Whether the state has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One entry of a store snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: LimiterKey,
    #[serde(flatten)]
    pub stored: StoredState,
}

/// Trait for limiter state storage.
///
/// Implementations must apply `update` atomically per key: two concurrent
/// updates of the same key never observe the same prior state.
pub trait LimiterStore: Send + Sync {
    /// Read-modify-write the state of `key`.
    ///
    /// The callback sees `None` for unknown keys. Leaving `None` in the slot
    /// removes the key. `now` is the instant of the update, used to tell
    /// expired states apart when the store has to make room.
    fn update(
        &self,
        key: &LimiterKey,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut Option<StoredState>),
    );

    /// Get a copy of the state of `key`.
    fn get(&self, key: &LimiterKey) -> Option<StoredState>;

    /// Remove the state of `key`. Returns whether it existed.
    fn remove(&self, key: &LimiterKey) -> bool;

    /// Remove the state of every client of `route`.
    fn remove_route(&self, route: &str) -> usize;

    /// Remove every state expired at `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    /// Number of stored states.
    fn len(&self) -> usize;

    /// Whether no state is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out every stored state.
    fn snapshot(&self) -> Vec<SnapshotEntry>;

    /// Load states, replacing existing ones with the same key.
    fn restore(&self, entries: Vec<SnapshotEntry>);
}

/// Process-local state store.
///
/// States live in a sharded concurrent map. With a capacity set, inserting a
/// new key into a full store first drops expired states, then evicts the
/// state that expires soonest if that was not enough.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: DashMap<LimiterKey, StoredState>,
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding at most `capacity` states.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            states: DashMap::with_capacity(capacity.min(1 << 16)),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Write every state to a JSON file.
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let entries = self.snapshot();
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), states = entries.len(), "Saved state snapshot");
        Ok(())
    }

    /// Load states from a JSON file written by `save_snapshot`.
    ///
    /// A missing file loads nothing.
    pub fn load_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }

        let contents = std::fs::read_to_string(path)?;
        let entries: Vec<SnapshotEntry> = serde_json::from_str(&contents)?;
        let count = entries.len();
        self.restore(entries);
        info!(path = %path.display(), states = count, "Loaded state snapshot");
        Ok(count)
    }

    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|capacity| self.states.len() >= capacity)
    }

    /// Drop expired states, then the state that expires soonest if still full.
    fn make_room(&self, now: DateTime<Utc>) {
        let purged = self.purge_expired(now);
        if purged > 0 {
            debug!(purged = purged, "Store full, purged expired states");
        }
        if !self.is_full() {
            return;
        }

        let victim = self
            .states
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            debug!(key = %key, "Store full, evicting state");
            self.states.remove(&key);
        }
    }
}

impl LimiterStore for MemoryStore {
    fn update(
        &self,
        key: &LimiterKey,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut Option<StoredState>),
    ) {
        // The map must not be scanned while an entry lock is held
        if self.is_full() && !self.states.contains_key(key) {
            self.make_room(now);
        }

        match self.states.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get().clone());
                apply(&mut slot);
                match slot {
                    Some(stored) => {
                        *occupied.get_mut() = stored;
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                apply(&mut slot);
                if let Some(stored) = slot {
                    vacant.insert(stored);
                }
            }
        }
    }

    fn get(&self, key: &LimiterKey) -> Option<StoredState> {
        self.states.get(key).map(|entry| entry.value().clone())
    }

    fn remove(&self, key: &LimiterKey) -> bool {
        self.states.remove(key).is_some()
    }

    fn remove_route(&self, route: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|key, _| key.route != route);
        before.saturating_sub(self.states.len())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.states.len();
        self.states.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.states.len())
    }

    fn len(&self) -> usize {
        self.states.len()
    }

    fn snapshot(&self) -> Vec<SnapshotEntry> {
        let mut entries: Vec<SnapshotEntry> = self
            .states
            .iter()
            .map(|entry| SnapshotEntry {
                key: entry.key().clone(),
                stored: entry.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn restore(&self, entries: Vec<SnapshotEntry>) {
        for entry in entries {
            self.states.insert(entry.key, entry.stored);
        }
    }
}
