//! Bounded, thread-safe recency cache with hit/miss statistics.
//!
//! Wraps the `lru` crate's map behind a `parking_lot::Mutex`: the lock is
//! held only around the O(1) map mutation, never across I/O or FHE
//! operations. Three instances of this cache exist in the store: records
//! by id, equality-query results, and range-query results.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache as LruMap;
use parking_lot::Mutex;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Current number of entries.
    pub size: usize,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Cumulative number of `get` calls that found an entry.
    pub hits: u64,
    /// Cumulative number of `get` calls that found nothing.
    pub misses: u64,
    /// `hits / (hits + misses)`, or `0.0` if there have been no lookups yet.
    pub hit_rate: f64,
}

/// A bounded LRU cache safe to share across threads.
pub struct LruCache<K, V> {
    inner: Mutex<LruMap<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Build a new cache with the given capacity.
    ///
    /// A capacity of `0` is coerced to `1` — `lru::LruCache` requires a
    /// nonzero bound.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        const ONE: NonZeroUsize = NonZeroUsize::MIN;
        let cap = NonZeroUsize::new(capacity).unwrap_or(ONE);
        Self {
            inner: Mutex::new(LruMap::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let found = inner.get(key).cloned();
        drop(inner);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert or overwrite `key`, evicting the least-recently-used entry if
    /// the cache is at capacity.
    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    /// Remove `key`, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    /// Drop every entry and reset the cumulative hit/miss counters.
    pub fn clear(&self) {
        self.inner.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// `true` if `key` is present, without affecting recency order or stats.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the current size, capacity, and cumulative hit/miss counts.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let size = inner.len();
        let capacity = inner.cap().get();
        drop(inner);
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits.saturating_add(misses);
        let hit_rate = if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = hits as f64 / total as f64;
            rate
        };
        CacheStats {
            size,
            capacity,
            hits,
            misses,
            hit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_hits() {
        let cache: LruCache<u64, String> = LruCache::new(4);
        cache.put(1, "one".to_string());
        assert_eq!(cache.get(&1), Some("one".to_string()));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn miss_increments_miss_counter() {
        let cache: LruCache<u64, String> = LruCache::new(4);
        assert_eq!(cache.get(&99), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn eviction_past_capacity_keeps_most_recently_used() {
        let cache: LruCache<u64, u64> = LruCache::new(2);
        cache.put(1, 1);
        cache.put(2, 2);
        // Promote 1 so 2 is now the least-recently-used entry.
        assert_eq!(cache.get(&1), Some(1));
        cache.put(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&3), Some(3));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn clear_empties_and_resets_stats() {
        let cache: LruCache<u64, u64> = LruCache::new(4);
        cache.put(1, 1);
        let _ = cache.get(&1);
        let _ = cache.get(&2);
        cache.clear();
        assert_eq!(cache.len(), 0);
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn remove_drops_single_entry() {
        let cache: LruCache<u64, u64> = LruCache::new(4);
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.remove(&1), Some(1));
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
    }

    #[test]
    fn hit_rate_reflects_cumulative_ratio() {
        let cache: LruCache<u64, u64> = LruCache::new(4);
        cache.put(1, 1);
        let _ = cache.get(&1); // hit
        let _ = cache.get(&2); // miss
        let stats = cache.stats();
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_capacity_coerced_to_one() {
        let cache: LruCache<u64, u64> = LruCache::new(0);
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.len(), 1);
    }
}
