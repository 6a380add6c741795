//! Engine configuration.
//!
//! Every field has a default, so a JSON document only needs the keys it
//! overrides:
//!
//! ```json
//! { "network_pool_size": 6, "download_parallelism": 3 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::CONNECT_TIMEOUT_SECS;
use crate::queue::{DEFAULT_CHARSET, DEFAULT_POOL_SIZE, QueueOptions};
use crate::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, DOWNLOAD_MAX_RETRIES,
    MAX_TIMEOUT, RetryPolicy,
};

/// Default number of concurrent downloads.
pub const DEFAULT_DOWNLOAD_PARALLELISM: usize = 2;

/// Default memory tier budget, in bytes.
pub const DEFAULT_MEMORY_CACHE_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on network workers.
pub const MAX_POOL_SIZE: usize = 64;

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`EngineConfig`].
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds a value outside its accepted range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Tunables for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Network workers in the request queue.
    pub network_pool_size: usize,
    /// Concurrent downloads; must stay below `network_pool_size`.
    pub download_parallelism: usize,
    /// Charset assumed when a response declares none.
    pub default_charset: String,
    /// TCP connect timeout for the default transport.
    pub connect_timeout_secs: u64,
    /// Timeout of the first attempt of an ordinary request.
    pub initial_timeout_ms: u64,
    /// Retries after the first attempt of an ordinary request.
    pub max_retries: u32,
    /// Timeout growth factor applied on each retry.
    pub backoff_multiplier: f32,
    /// Retries allowed for each download.
    pub download_max_retries: u32,
    /// Byte budget of the memory cache tier. Zero disables caching.
    pub memory_cache_bytes: usize,
    /// Overrides the default `User-Agent`.
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network_pool_size: DEFAULT_POOL_SIZE,
            download_parallelism: DEFAULT_DOWNLOAD_PARALLELISM,
            default_charset: DEFAULT_CHARSET.to_string(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            initial_timeout_ms: u64::try_from(DEFAULT_TIMEOUT.as_millis()).unwrap_or(2500),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            download_max_retries: DOWNLOAD_MAX_RETRIES,
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
            user_agent: None,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_pool_size < 2 || self.network_pool_size > MAX_POOL_SIZE {
            return Err(ConfigError::invalid(
                "network_pool_size",
                format!("must be between 2 and {MAX_POOL_SIZE}, got {}", self.network_pool_size),
            ));
        }
        if self.download_parallelism == 0 || self.download_parallelism >= self.network_pool_size {
            return Err(ConfigError::invalid(
                "download_parallelism",
                format!(
                    "must be at least 1 and below network_pool_size ({}), got {}",
                    self.network_pool_size, self.download_parallelism
                ),
            ));
        }
        if self.default_charset.trim().is_empty() {
            return Err(ConfigError::invalid("default_charset", "must not be empty"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid("connect_timeout_secs", "must be positive"));
        }
        if self.initial_timeout_ms == 0 || self.initial_timeout() > MAX_TIMEOUT {
            return Err(ConfigError::invalid(
                "initial_timeout_ms",
                format!("must be between 1 and {}", MAX_TIMEOUT.as_millis()),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 0.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be a non-negative number, got {}", self.backoff_multiplier),
            ));
        }
        if let Some(agent) = &self.user_agent
            && agent.trim().is_empty()
        {
            return Err(ConfigError::invalid("user_agent", "must not be empty when set"));
        }
        Ok(())
    }

    /// Timeout of the first attempt.
    #[must_use]
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    /// Retry policy for ordinary requests.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.initial_timeout(), self.max_retries, self.backoff_multiplier)
    }

    /// Retry policy for downloads.
    #[must_use]
    pub fn download_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.initial_timeout(),
            self.download_max_retries,
            self.backoff_multiplier,
        )
    }

    /// Options for the request queue.
    #[must_use]
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            pool_size: self.network_pool_size,
            default_charset: self.default_charset.clone(),
        }
    }
}
