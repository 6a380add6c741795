//! Ordered composition of cache tiers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, instrument, warn};

use super::{Cache, CacheEntry, TierId};

/// A set of cache tiers addressed by [`TierId`].
///
/// Each request carries its own tier sequence, fastest first. Lookups walk
/// that sequence and promote a hit into every earlier tier; writes, removals
/// and invalidations touch every tier in the sequence. Ids without a
/// registered tier are skipped.
///
/// Writes are best effort: a failing tier is logged and the remaining tiers
/// are still written, with no rollback.
#[derive(Clone, Default)]
pub struct CacheChain {
    tiers: HashMap<TierId, Arc<dyn Cache>>,
}

impl fmt::Debug for CacheChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.tiers.keys().collect();
        ids.sort();
        f.debug_struct("CacheChain").field("tiers", &ids).finish()
    }
}

/// Builder for [`CacheChain`].
#[derive(Default)]
pub struct CacheChainBuilder {
    tiers: HashMap<TierId, Arc<dyn Cache>>,
}

impl CacheChainBuilder {
    /// Registers a tier, replacing any tier with the same id.
    #[must_use]
    pub fn tier(mut self, id: TierId, cache: Arc<dyn Cache>) -> Self {
        self.tiers.insert(id, cache);
        self
    }

    /// Builds the chain.
    #[must_use]
    pub fn build(self) -> CacheChain {
        CacheChain { tiers: self.tiers }
    }
}

impl CacheChain {
    /// Starts building a chain.
    #[must_use]
    pub fn builder() -> CacheChainBuilder {
        CacheChainBuilder::default()
    }

    /// True when a tier is registered under `id`.
    #[must_use]
    pub fn has_tier(&self, id: TierId) -> bool {
        self.tiers.contains_key(&id)
    }

    /// Returns the tier registered under `id`.
    #[must_use]
    pub fn tier(&self, id: TierId) -> Option<&Arc<dyn Cache>> {
        self.tiers.get(&id)
    }

    /// Initializes every tier, logging failures.
    pub async fn initialize(&self) {
        for (id, cache) in &self.tiers {
            if let Err(error) = cache.initialize().await {
                warn!(tier = %id, cache = cache.name(), %error, "cache tier failed to initialize");
            }
        }
    }

    /// Finds the first hit along `sequence` and copies it into earlier tiers.
    #[instrument(skip(self, sequence), fields(tiers = sequence.len()))]
    pub async fn get_entry(&self, key: &str, sequence: &[TierId]) -> Option<CacheEntry> {
        for (position, id) in sequence.iter().enumerate() {
            let Some(cache) = self.tiers.get(id) else {
                continue;
            };
            let entry = match cache.get(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(error) => {
                    warn!(tier = %id, %error, "cache lookup failed");
                    continue;
                }
            };

            debug!(tier = %id, cache = cache.name(), "cache tier hit");
            for earlier in sequence[..position].iter().rev() {
                if let Some(faster) = self.tiers.get(earlier)
                    && let Err(error) = faster.put(key, entry.clone()).await
                {
                    warn!(tier = %earlier, %error, "cache promotion failed");
                }
            }
            return Some(entry);
        }
        None
    }

    /// Writes `entry` into every tier of `sequence`.
    #[instrument(skip(self, entry, sequence), fields(bytes = entry.size()))]
    pub async fn put_entry(&self, key: &str, entry: &CacheEntry, sequence: &[TierId]) {
        for id in sequence {
            if let Some(cache) = self.tiers.get(id)
                && let Err(error) = cache.put(key, entry.clone()).await
            {
                warn!(tier = %id, %error, "cache write failed");
            }
        }
    }

    /// Removes `key` from every tier of `sequence`.
    pub async fn remove_entry(&self, key: &str, sequence: &[TierId]) {
        for id in sequence {
            if let Some(cache) = self.tiers.get(id)
                && let Err(error) = cache.remove(key).await
            {
                warn!(tier = %id, key, %error, "cache remove failed");
            }
        }
    }

    /// Rewrites the expiry of `key` in every tier of `sequence`.
    pub async fn invalidate_entry(&self, key: &str, expire_time: SystemTime, sequence: &[TierId]) {
        for id in sequence {
            if let Some(cache) = self.tiers.get(id)
                && let Err(error) = cache.invalidate(key, expire_time).await
            {
                warn!(tier = %id, key, %error, "cache invalidate failed");
            }
        }
    }

    /// Clears every registered tier.
    pub async fn clear(&self) {
        for (id, cache) in &self.tiers {
            if let Err(error) = cache.clear().await {
                warn!(tier = %id, %error, "cache clear failed");
            }
        }
    }
}
