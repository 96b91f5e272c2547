//! Generic key/value cache stores.
//!
//! Providers never manage expiry themselves: a [`CacheStore`] owns TTL and
//! eviction. [`InMemoryCacheStore`] is the default store and is enough for a
//! single process; hosts can plug in any other map-like store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::sync::Cache;
use tracing::debug;

/// Map-like cache store with provider-scoped string keys.
pub trait CacheStore<V>: Send + Sync {
    /// Returns the value for `key` if present and not expired.
    fn get(&self, key: &str) -> Option<V>;

    /// Inserts or replaces the value for `key`.
    fn put(&self, key: String, value: V);

    /// Removes the value for `key`.
    fn remove(&self, key: &str);

    /// Removes every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &str);

    /// Number of stored entries (expired entries may still be counted).
    fn len(&self) -> usize;

    /// Returns true if the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store backed by a `moka` cache, with optional TTL and capacity.
pub struct InMemoryCacheStore<V> {
    entries: Cache<String, V>,
}

impl<V> std::fmt::Debug for InMemoryCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheStore")
            .field("entries", &self.entries.entry_count())
            .field("max_entries", &self.entries.policy().max_capacity())
            .field("ttl", &self.entries.policy().time_to_live())
            .finish()
    }
}

impl<V> InMemoryCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an unbounded store without expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::bounded(None, None)
    }

    /// Create a store expiring entries after `ttl` and holding at most
    /// `max_entries`.
    #[must_use]
    pub fn bounded(ttl: Option<Duration>, max_entries: Option<u64>) -> Self {
        let mut builder = Cache::builder().eviction_listener(
            |key: Arc<String>, _value: V, cause: RemovalCause| {
                if cause.was_evicted() {
                    debug!(key = %key, cause = ?cause, "cache entry evicted");
                }
            },
        );
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        if let Some(max_entries) = max_entries {
            builder = builder.max_capacity(max_entries);
        }
        Self {
            entries: builder.build(),
        }
    }
}

impl<V> Default for InMemoryCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheStore<V> for InMemoryCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key)
    }

    fn put(&self, key: String, value: V) {
        self.entries.insert(key, value);
    }

    fn remove(&self, key: &str) {
        self.entries.invalidate(key);
    }

    fn remove_prefix(&self, prefix: &str) {
        let matching: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in matching {
            self.entries.invalidate(key.as_str());
        }
    }

    fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered by a positive entry
    pub hits: u64,
    /// Lookups answered by a negative entry
    pub negative_hits: u64,
    /// Lookups that had to go to the directory
    pub misses: u64,
}

impl CacheStats {
    /// Calculate the ratio of lookups served from cache (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let served = self.hits + self.negative_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Lock-free counters backing [`CacheStats`].
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCounters {
    /// Record a positive hit.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a negative hit.
    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.negative_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
