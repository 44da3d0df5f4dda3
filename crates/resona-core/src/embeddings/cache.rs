//! Embedding cache
//!
//! Bounded, TTL-gated map from content hash to vector. Reads use `peek`
//! so entries are never promoted: capacity eviction therefore drops the
//! least-recently-inserted entry, and a hot entry still expires once its
//! TTL lapses.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;

use super::content_hash;

/// Default cache capacity
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default entry time-to-live
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Cumulative cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

struct Entry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// Concurrent embedding cache keyed by content hash
pub struct EmbeddingCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl EmbeddingCache {
    /// Create a cache with the given capacity and TTL
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up the cached vector for a text.
    ///
    /// Expired entries are dropped on sight and count as misses.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = content_hash(text);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let fresh = match entries.peek(&key) {
            Some(entry) => entry.inserted_at.elapsed() < self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if !fresh {
            entries.pop(&key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.peek(&key).map(|e| e.vector.clone())
    }

    /// Insert a vector, evicting the oldest entry under capacity pressure
    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let key = content_hash(text);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.put(
            key,
            Entry {
                vector,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Cumulative counters and current size
    pub fn stats(&self) -> CacheStats {
        let size = match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
