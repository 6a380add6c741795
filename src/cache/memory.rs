//! In-process cache tiers.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use lru::LruCache;
use tracing::trace;

use super::{Cache, CacheEntry, CacheError};

/// Byte-bounded LRU cache held in memory.
///
/// Entries are kept in access order; inserting past the capacity evicts the
/// least recently used entries until the total body size fits again.
#[derive(Debug)]
pub struct MemoryCache {
    capacity: usize,
    state: Mutex<LruState>,
}

/// Entries bounded by byte size, not count, so the map itself is unbounded.
#[derive(Debug)]
struct LruState {
    entries: LruCache<String, CacheEntry>,
    size: usize,
}

impl LruState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.size -= entry.size();
        Some(entry)
    }
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` bytes of response bodies.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                size: 0,
            }),
        }
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total body bytes currently held.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when no entry is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        if entry.size() > self.capacity {
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
                size: entry.size(),
                capacity: self.capacity,
            });
        }

        let mut state = self.lock();
        state.remove(key);
        state.size += entry.size();
        state.entries.put(key.to_string(), entry);

        while state.size > self.capacity {
            let Some((evicted, entry)) = state.entries.pop_lru() else {
                break;
            };
            state.size -= entry.size();
            trace!(key = %evicted, bytes = entry.size(), "evicted");
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.entries.clear();
        state.size = 0;
        Ok(())
    }
}

/// A tier that stores nothing and never hits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    fn name(&self) -> &str {
        "none"
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
