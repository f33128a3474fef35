use lru::LruCache;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Upper bounds enforced after every mutation of an [`ImageCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            max_entries: 100,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry<V> {
    payload: V,
    size_cost: usize,
}

struct Inner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    total_bytes: usize,
    limits: CacheLimits,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded in-memory cache of decoded images keyed by URL.
///
/// Eviction is strict least-recently-used over both the entry count and the
/// aggregate byte cost. The cache is shared by cloning; it never fails, a
/// poisoned lock is simply taken over.
pub struct ImageCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V> Clone for ImageCache<V> {
    fn clone(&self) -> Self {
        ImageCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> ImageCache<V> {
    pub fn new(limits: CacheLimits) -> Self {
        ImageCache {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                limits,
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let found = inner.entries.get(key).map(|e| e.payload.clone());
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Presence check that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains(key)
    }

    /// Insert or replace `key`, then evict least-recently-used entries until
    /// both limits hold again. Returns the evicted keys.
    ///
    /// A payload whose cost alone exceeds `max_bytes` is not cached, and any
    /// older payload under the same key is dropped with it.
    pub fn put(&self, key: impl Into<String>, payload: V, size_cost: usize) -> Vec<String> {
        let key = key.into();
        let mut inner = self.lock();
        if inner.limits.max_entries == 0 || size_cost > inner.limits.max_bytes {
            tracing::warn!(key = %key, size_cost, "Image too large for cache, not stored");
            if let Some(old) = inner.entries.pop(key.as_str()) {
                inner.total_bytes -= old.size_cost;
            }
            return Vec::new();
        }

        if let Some(old) = inner.entries.put(key, CacheEntry { payload, size_cost }) {
            inner.total_bytes -= old.size_cost;
        }
        inner.total_bytes += size_cost;

        let mut evicted = Vec::new();
        while inner.entries.len() > inner.limits.max_entries
            || inner.total_bytes > inner.limits.max_bytes
        {
            match inner.entries.pop_lru() {
                Some((old_key, old)) => {
                    inner.total_bytes -= old.size_cost;
                    inner.evictions += 1;
                    evicted.push(old_key);
                }
                None => break,
            }
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), bytes = inner.total_bytes, "Evicted images");
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let old = inner.entries.pop(key)?;
        inner.total_bytes -= old.size_cost;
        Some(old.payload)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn limits(&self) -> CacheLimits {
        self.lock().limits
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .rev()
            .map(|(k, _)| k.clone())
            .collect()
    }
}
