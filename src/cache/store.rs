//! Bounded TTL store.
//!
//! Entries are kept in storage order: overwriting a key moves it to the
//! newest position, and reads never reorder. Capacity eviction therefore
//! always removes the oldest `stored_at` first.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_STORE_HIT: &str = "studysync_store_hit_total";
const METRIC_STORE_MISS: &str = "studysync_store_miss_total";
const METRIC_STORE_EVICT: &str = "studysync_store_evict_total";
const METRIC_STORE_EXPIRED: &str = "studysync_store_expired_total";

/// A stored value together with the outcome that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub stored_at: Instant,
    pub status_code: u16,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.age() > self.ttl
    }
}

/// Key → entry cache with lazy expiry and a hard entry limit.
pub struct TtlStore<V> {
    entries: RwLock<LruCache<String, CacheEntry<V>>>,
    ttl: Duration,
    max_entries: NonZeroUsize,
}

impl<V: Clone> TtlStore<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.ttl(), config.max_entries_non_zero())
    }

    pub fn with_limits(ttl: Duration, max_entries: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
            ttl,
            max_entries,
        }
    }

    /// Default time-to-live applied by [`TtlStore::set`].
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.get()
    }

    /// Look up an entry, treating anything older than its TTL as absent.
    ///
    /// Expired entries are left in place for [`TtlStore::sweep`].
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let entry = rw_read(&self.entries, SOURCE, "get")
            .peek(key)
            .filter(|entry| !entry.is_expired())
            .cloned();

        if entry.is_some() {
            counter!(METRIC_STORE_HIT).increment(1);
        } else {
            counter!(METRIC_STORE_MISS).increment(1);
        }
        entry
    }

    /// Whether `key` holds an unexpired entry younger than `max_age`.
    pub fn contains_fresh(&self, key: &str, max_age: Duration) -> bool {
        rw_read(&self.entries, SOURCE, "contains_fresh")
            .peek(key)
            .is_some_and(|entry| !entry.is_expired() && entry.age() < max_age)
    }

    /// Insert or replace an entry using the store's default TTL.
    ///
    /// Returns the keys evicted by the trim that follows the insertion.
    pub fn set(&self, key: impl Into<String>, payload: V, status_code: u16) -> Vec<String> {
        self.set_with_ttl(key, payload, status_code, self.ttl)
    }

    /// Insert or replace an entry with its own TTL.
    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        payload: V,
        status_code: u16,
        ttl: Duration,
    ) -> Vec<String> {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            stored_at: Instant::now(),
            status_code,
            ttl,
        };
        rw_write(&self.entries, SOURCE, "set").push(key, entry);
        self.trim()
    }

    /// Evict oldest entries until the store is back at its limit.
    pub fn trim(&self) -> Vec<String> {
        let mut entries = rw_write(&self.entries, SOURCE, "trim");
        let mut evicted = Vec::new();
        while entries.len() > self.max_entries.get() {
            let Some((key, _)) = entries.pop_lru() else {
                break;
            };
            counter!(METRIC_STORE_EVICT).increment(1);
            debug!(key = %key, "Evicted oldest cache entry over capacity");
            evicted.push(key);
        }
        evicted
    }

    /// Remove every entry older than its TTL. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "sweep");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            counter!(METRIC_STORE_EXPIRED).increment(expired.len() as u64);
            debug!(removed = expired.len(), "Swept expired cache entries");
        }
        expired.len()
    }

    /// Drop a single entry. Returns whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        rw_write(&self.entries, SOURCE, "invalidate")
            .pop(key)
            .is_some()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Keys from oldest to newest `stored_at`, expired entries included.
    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.entries, SOURCE, "keys")
            .iter()
            .rev()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of held entries, expired entries included.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
