//! Reachability cache: the most recent sighting of each peer.
//!
//! A concurrent map from device id to the addresses and relays that device
//! last announced. Written by the receive loop, read by lookups from any
//! task. Freshness is judged at read time: an entry older than the cache
//! lifetime is still stored but no longer answers lookups.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use tether_core::{DeviceId, Relay};

/// What we last heard from a peer.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Direct addresses after normalization against the datagram source.
    pub direct: Vec<String>,
    /// Relays exactly as announced.
    pub relays: Vec<Relay>,
    /// Local processing time of the announcement. Never sender-supplied.
    pub when: Instant,
    /// Set when the entry was populated by an actual sighting.
    pub found: bool,
}

impl CacheEntry {
    /// Entry for a sighting processed now.
    pub fn seen_now(direct: Vec<String>, relays: Vec<Relay>) -> Self {
        Self {
            direct,
            relays,
            when: Instant::now(),
            found: true,
        }
    }
}

/// Shared handle to the cache. Clones see the same entries.
#[derive(Debug, Clone)]
pub struct ReachabilityCache {
    entries: Arc<DashMap<DeviceId, CacheEntry>>,
    lifetime: Duration,
}

impl ReachabilityCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// The stored entry for `id`, stale or not. `None` if never written
    /// (or evicted by [`prune`](Self::prune)).
    pub fn get(&self, id: &DeviceId) -> Option<CacheEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Replace the entry for `id`. Last writer wins; address lists are not merged.
    pub fn set(&self, id: DeviceId, entry: CacheEntry) {
        self.entries.insert(id, entry);
    }

    pub fn is_stale(&self, entry: &CacheEntry) -> bool {
        entry.when.elapsed() >= self.lifetime
    }

    /// The entry for `id` if it exists and is fresh.
    pub fn fresh(&self, id: &DeviceId) -> Option<CacheEntry> {
        self.get(id)
            .filter(|entry| entry.found && !self.is_stale(entry))
    }

    /// Remove entries not refreshed within `max_age`. Returns the number removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.when.elapsed() < max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of all fresh entries, for status output.
    pub fn snapshot(&self) -> Vec<(DeviceId, CacheEntry)> {
        self.entries
            .iter()
            .filter(|e| !self.is_stale(e.value()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}
