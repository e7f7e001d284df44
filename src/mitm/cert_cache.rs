//! Leaf certificate cache
//!
//! LRU keyed by normalized host. Values are cheap handles (`Arc`s), so
//! lookups hand out clones and never hold a borrow into the cache.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Default number of cached hosts
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Certificate cache with LRU eviction policy
pub struct CertCache<V> {
    cache: LruCache<String, V>,
    hits: u64,
    misses: u64,
}

impl<V: Clone> CertCache<V> {
    /// Create a cache holding at most `capacity` hosts (0 falls back to the default)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a host, counting the hit or miss
    pub fn get(&mut self, host: &str) -> Option<V> {
        match self.cache.get(host) {
            Some(value) => {
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert unless another caller got there first; returns the cached value
    pub fn insert_if_absent(&mut self, host: String, value: V) -> V {
        if let Some(existing) = self.cache.get(&host) {
            return existing.clone();
        }
        self.cache.put(host, value.clone());
        value
    }

    /// Get the number of certificates in the cache
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Get the cache capacity
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Get the cache hit rate (hits / total requests)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = CertCache::new(10);
        cache.insert_if_absent("example.com".to_string(), Arc::new(1));

        assert_eq!(cache.len(), 1);
        assert!(cache.get("example.com").is_some());
        assert!(cache.get("nonexistent.com").is_none());
    }

    #[test]
    fn test_first_insert_wins() {
        let mut cache = CertCache::new(10);
        let first = cache.insert_if_absent("example.com".to_string(), Arc::new(1));
        let second = cache.insert_if_absent("example.com".to_string(), Arc::new(2));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*cache.get("example.com").unwrap(), 1);
    }

    #[test]
    fn test_cache_hit_rate() {
        let mut cache = CertCache::new(10);
        cache.insert_if_absent("example.com".to_string(), Arc::new(1));

        cache.get("example.com");
        cache.get("nonexistent1.com");
        cache.get("nonexistent2.com");

        assert!((cache.hit_rate() - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = CertCache::new(2);

        cache.insert_if_absent("domain1.com".to_string(), Arc::new(1));
        cache.insert_if_absent("domain2.com".to_string(), Arc::new(2));
        cache.insert_if_absent("domain3.com".to_string(), Arc::new(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("domain1.com").is_none());
        assert!(cache.get("domain2.com").is_some());
        assert!(cache.get("domain3.com").is_some());
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let cache: CertCache<Arc<u8>> = CertCache::new(0);
        assert_eq!(cache.capacity(), DEFAULT_CAPACITY);
    }
}
