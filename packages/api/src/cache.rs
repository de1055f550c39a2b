//! Bounded least-recently-used cache for taxonomic group lists.
//!
//! Taxonomic groups rarely change but are needed on every observation
//! download iteration. Each [`TransferClient`](crate::TransferClient) owns
//! one cache, so nothing leaks between sites or tests.
//!
//! Lookups take the read lock only; recency is tracked with an atomic tick
//! per entry so concurrent readers do not serialize on a write lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use vn_sync_api_models::TaxoGroup;

struct Entry {
    groups: Vec<TaxoGroup>,
    last_used: AtomicU64,
}

/// Bounded LRU cache keyed by the request parameters of the list call.
pub struct TaxoGroupCache {
    capacity: usize,
    tick: AtomicU64,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl std::fmt::Debug for TaxoGroupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaxoGroupCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl TaxoGroupCache {
    /// Creates a cache holding at most `capacity` entries. A capacity of `0`
    /// disables caching.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: AtomicU64::new(0),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns a copy of the cached groups for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<TaxoGroup>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|entry| {
            entry.last_used.store(self.next_tick(), Ordering::Relaxed);
            entry.groups.clone()
        })
    }

    /// Stores `groups` under `key`, evicting the least recently used entry
    /// when full.
    pub fn insert(&self, key: &str, groups: Vec<TaxoGroup>) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                log::debug!("Evicting taxo group cache entry {oldest}");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                groups,
                last_used: AtomicU64::new(self.next_tick()),
            },
        );
    }

    /// Drops every cached entry.
    pub fn invalidate(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }
}
