//! Wires the delivery context, request queue and file downloader together.
//!
//! An [`Engine`] owns everything a caller needs to submit requests. It is
//! built once, handed to call sites by reference, and torn down with
//! [`Engine::shutdown`].
//!
//! # Example
//!
//! ```no_run
//! use fetchq_core::{Engine, EngineConfig};
//! use fetchq_core::request::StringStrategy;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::with_default_network(EngineConfig::default())?;
//! let request = engine.request("https://example.com", StringStrategy::new()).build();
//! engine.queue().add(request);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::{CacheChain, MemoryCache, TierId};
use crate::config::{ConfigError, EngineConfig};
use crate::delivery::Delivery;
use crate::download::{DownloaderError, FileDownloader};
use crate::network::{Network, ReqwestNetwork};
use crate::queue::RequestQueue;
use crate::request::{Request, RequestBuilder, RequestStrategy};

/// Errors raised while starting an [`Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The file downloader could not be created.
    #[error(transparent)]
    Downloader(#[from] DownloaderError),

    /// The default HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// A running request pipeline.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    queue: RequestQueue,
    downloader: FileDownloader,
    shutdown: CancellationToken,
    delivery_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Starts the delivery context, the request queue and the downloader.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the configuration is invalid.
    #[instrument(skip_all, fields(pool_size = config.network_pool_size))]
    pub fn start(
        config: EngineConfig,
        network: Arc<dyn Network>,
        cache: Option<CacheChain>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (delivery, delivery_loop) = Delivery::channel();
        let delivery_task = tokio::spawn(delivery_loop.run_until(shutdown.clone()));

        let queue = RequestQueue::new(network, cache, delivery, config.queue_options());
        let downloader = match FileDownloader::with_retry_policy(
            queue.clone(),
            config.download_parallelism,
            config.download_retry_policy(),
        ) {
            Ok(downloader) => downloader,
            Err(error) => {
                shutdown.cancel();
                return Err(error.into());
            }
        };
        queue.start();

        info!(
            download_parallelism = config.download_parallelism,
            cache = queue.cache().is_some(),
            "engine started"
        );
        Ok(Self {
            config,
            queue,
            downloader,
            shutdown,
            delivery_task: Some(delivery_task),
        })
    }

    /// Starts an engine over [`ReqwestNetwork`] with a memory cache tier.
    ///
    /// A `memory_cache_bytes` of zero runs without a cache.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn with_default_network(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let network = ReqwestNetwork::new(config.connect_timeout_secs, config.user_agent.as_deref())
            .map_err(EngineError::HttpClient)?;
        let cache = (config.memory_cache_bytes > 0).then(|| {
            CacheChain::builder()
                .tier(TierId::MEMORY, Arc::new(MemoryCache::new(config.memory_cache_bytes)))
                .build()
        });
        Self::start(config, Arc::new(network), cache)
    }

    /// Starts building a request carrying the configured retry policy.
    ///
    /// File downloads belong on [`downloader`](Self::downloader), which
    /// applies [`EngineConfig::download_retry_policy`] instead.
    #[must_use]
    pub fn request<S: RequestStrategy>(
        &self,
        url: impl Into<String>,
        strategy: S,
    ) -> RequestBuilder<S::Output> {
        Request::builder(url, strategy).retry_policy(self.config.retry_policy())
    }

    /// The request queue.
    #[must_use]
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// The file downloader.
    #[must_use]
    pub fn downloader(&self) -> &FileDownloader {
        &self.downloader
    }

    /// The configuration the engine was started with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stops the workers and the delivery context, waiting for both.
    ///
    /// Callbacks already posted are delivered before this returns; requests
    /// still queued are abandoned.
    pub async fn shutdown(mut self) {
        self.downloader.clear_all();
        self.queue.stop().await;
        self.shutdown.cancel();
        if let Some(task) = self.delivery_task.take()
            && let Err(error) = task.await
        {
            warn!(%error, "delivery context exited abnormally");
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.queue.shutdown_token().cancel();
    }
}
