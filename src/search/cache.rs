//! Bounded LRU cache for expensive per-core collector results.
//!
//! Keys compare by value, so rebuilt query expressions hit the same entry. Every
//! operation takes the lock once; a reader never observes a half-written entry.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

pub struct CollectorCache<K: Hash + Eq, V> {
    name: &'static str,
    entries: Mutex<LruCache<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> CollectorCache<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value, promoted to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.entries.lock().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn put(&self, key: K, value: V) {
        self.entries.lock().put(key, value);
    }

    /// Return the cached value or build, store and return it.
    ///
    /// The factory runs without the lock held, so two racing misses may both build;
    /// the later insert wins and both callers get an equivalent value.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cache = self.name, "cache_miss");
        let value = build()?;
        self.put(key, value.clone());
        Ok(value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for CollectorCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorCache")
            .field("name", &self.name)
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueryExpr;
    use std::sync::Arc;

    #[test]
    fn evicts_least_recently_used() {
        let cache: CollectorCache<u32, u32> = CollectorCache::new("test", 2);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.get(&1), Some(10));
        cache.put(3, 30);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn factory_runs_once_per_key() {
        let cache: CollectorCache<QueryExpr, Arc<String>> = CollectorCache::new("filters", 4);
        let mut builds = 0;
        for _ in 0..3 {
            let expr = QueryExpr::eq("N", "true");
            let value = cache
                .get_or_try_insert_with(expr, || {
                    builds += 1;
                    Ok::<_, std::io::Error>(Arc::new("bits".to_string()))
                })
                .unwrap();
            assert_eq!(value.as_str(), "bits");
        }
        assert_eq!(builds, 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (2, 1, 1));
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let cache: CollectorCache<u8, u8> = CollectorCache::new("scores", 4);
        let err = cache.get_or_try_insert_with(1, || Err::<u8, _>("nope"));
        assert_eq!(err, Err("nope"));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_purges_everything() {
        let cache: CollectorCache<u8, u8> = CollectorCache::new("scores", 0);
        cache.put(1, 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }
}
