//! Response caching.
//!
//! # Overview
//!
//! A [`CacheEntry`] holds the raw bytes of a response together with two
//! timestamps: the expiry, after which the entry is never served, and the
//! optional refresh time, after which the entry is served but refreshed from
//! the network. Entries live in one or more [`Cache`] tiers composed by a
//! [`CacheChain`] that promotes hits into faster tiers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fetchq_core::cache::{CacheChain, MemoryCache, TierId};
//!
//! let chain = CacheChain::builder()
//!     .tier(TierId::MEMORY, Arc::new(MemoryCache::new(4 * 1024 * 1024)))
//!     .build();
//! assert!(chain.has_tier(TierId::MEMORY));
//! ```

mod chain;
mod memory;

use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::BoxError;

pub use chain::{CacheChain, CacheChainBuilder};
pub use memory::{MemoryCache, NoCache};

/// Identifier of a cache tier within a [`CacheChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TierId(pub u32);

impl TierId {
    /// Conventional id of the in-memory tier.
    pub const MEMORY: TierId = TierId(0);
    /// Conventional id of a persistent tier.
    pub const DISK: TierId = TierId(1);
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier-{}", self.0)
    }
}

/// A cached response body with its freshness timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Raw response body.
    pub data: Bytes,
    /// Charset the body was served with.
    pub charset: String,
    /// Wall-clock time after which the entry is never served.
    pub expire_time: SystemTime,
    /// Wall-clock time after which the entry is served but refreshed.
    ///
    /// `None` means the refresh threshold equals the expiry.
    pub refresh_time: Option<SystemTime>,
}

impl CacheEntry {
    /// Creates an already-expired entry; callers stamp the expiry before storing.
    pub fn new(data: Bytes, charset: impl Into<String>) -> Self {
        Self {
            data,
            charset: charset.into(),
            expire_time: SystemTime::UNIX_EPOCH,
            refresh_time: None,
        }
    }

    /// Sets the expiry to `now + ttl`.
    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expire_time = SystemTime::now() + ttl;
        self
    }

    /// Sets the refresh threshold to `now + after`.
    #[must_use]
    pub fn refresh_in(mut self, after: Duration) -> Self {
        self.refresh_time = Some(SystemTime::now() + after);
        self
    }

    /// True when the expiry lies in the past.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// True when the expiry lies before `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expire_time < now
    }

    /// True when the entry should be refreshed from the network.
    #[must_use]
    pub fn refresh_needed(&self) -> bool {
        self.refresh_needed_at(SystemTime::now())
    }

    /// True when the refresh threshold (or, without one, the expiry) lies before `now`.
    #[must_use]
    pub fn refresh_needed_at(&self, now: SystemTime) -> bool {
        match self.refresh_time {
            Some(refresh) => refresh < now,
            None => self.is_expired_at(now),
        }
    }

    /// Size of the body in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Errors raised by a cache tier.
///
/// Tier failures never fail a request; the chain logs them and carries on.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The entry alone exceeds the tier's capacity.
    #[error("entry {key} ({size} bytes) exceeds tier capacity of {capacity} bytes")]
    EntryTooLarge {
        /// The rejected key.
        key: String,
        /// Entry size in bytes.
        size: usize,
        /// Tier capacity in bytes.
        capacity: usize,
    },

    /// The backing store failed.
    #[error("cache backend {tier} failed: {source}")]
    Backend {
        /// Name of the failing tier.
        tier: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}

impl CacheError {
    /// Creates a backend error.
    pub fn backend(tier: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Backend {
            tier: tier.into(),
            source: source.into(),
        }
    }
}

/// One cache tier.
///
/// Implementations must be safe to call from several workers at once.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &str;

    /// Prepares the tier; called once by the cache worker before serving.
    async fn initialize(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// Looks up an entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores or replaces an entry.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Removes an entry if present.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Rewrites the expiry of an existing entry; absent keys are ignored.
    async fn invalidate(&self, key: &str, expire_time: SystemTime) -> Result<(), CacheError> {
        if let Some(mut entry) = self.get(key).await? {
            entry.expire_time = expire_time;
            entry.refresh_time = None;
            self.put(key, entry).await?;
        }
        Ok(())
    }

    /// Drops every entry.
    async fn clear(&self) -> Result<(), CacheError>;
}
