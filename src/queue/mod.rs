//! Request admission and worker management.
//!
//! # Overview
//!
//! [`RequestQueue`] assigns each admitted request a sequence number, tracks it
//! until it reaches a terminal state, and routes it into the pipeline:
//!
//! - requests that cache, when a cache chain is configured, go to the cache
//!   worker first
//! - everything else goes straight to the network workers
//!
//! Both stages pop requests by priority, then by sequence number.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchq_core::{Delivery, QueueOptions, RequestQueue};
//! use fetchq_core::network::ReqwestNetwork;
//! use fetchq_core::request::{Request, StringStrategy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Arc::new(ReqwestNetwork::new(30, None)?);
//! let queue = RequestQueue::new(network, None, Delivery::immediate(), QueueOptions::default());
//! queue.start();
//! queue.add(Request::builder("https://example.com", StringStrategy::new()).tag("home").build());
//! queue.cancel_all("home");
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

mod priority;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheChain;
use crate::delivery::Delivery;
use crate::dispatch::{Dispatch, cache_dispatcher, network_dispatcher};
use crate::network::Network;
use crate::request::{Request, RequestCore};

pub(crate) use priority::PriorityChannel;

/// Default number of network workers.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default charset when a response does not declare one.
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Queue construction options.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Number of network workers.
    pub pool_size: usize,
    /// Charset assumed when `Content-Type` carries none.
    pub default_charset: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            default_charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

/// State shared by the queue handle and its workers.
pub(crate) struct QueueShared {
    pub(crate) network: Arc<dyn Network>,
    pub(crate) cache: Option<Arc<CacheChain>>,
    pub(crate) delivery: Delivery,
    pub(crate) cache_queue: PriorityChannel,
    pub(crate) network_queue: Arc<PriorityChannel>,
    pub(crate) default_charset: String,
    pub(crate) shutdown: CancellationToken,
    in_flight: DashMap<u64, Arc<dyn Dispatch>>,
    sequence: AtomicU64,
}

impl QueueShared {
    /// Drops in-flight bookkeeping for a request that reached a terminal state.
    pub(crate) fn finish(&self, core: &RequestCore) {
        let Some(sequence) = core.sequence() else {
            return;
        };
        if self.in_flight.remove(&sequence).is_some()
            && let Some(age) = core.age()
            && age >= SLOW_REQUEST_THRESHOLD
        {
            info!(
                url = core.url(),
                sequence,
                lifetime_ms = age.as_millis(),
                "slow request"
            );
        }
    }
}

/// Requests living longer than this are logged when they finish.
pub(crate) const SLOW_REQUEST_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(3);

/// Admits requests and runs the cache and network workers.
///
/// Cloning the handle shares the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<QueueShared>,
    pool_size: usize,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pool_size", &self.pool_size)
            .field("in_flight", &self.in_flight_count())
            .field("cache", &self.shared.cache)
            .finish_non_exhaustive()
    }
}

impl RequestQueue {
    /// Creates a stopped queue. Call [`start`](Self::start) to spawn workers.
    #[must_use]
    pub fn new(
        network: Arc<dyn Network>,
        cache: Option<CacheChain>,
        delivery: Delivery,
        options: QueueOptions,
    ) -> Self {
        let shared = QueueShared {
            network,
            cache: cache.map(Arc::new),
            delivery,
            cache_queue: PriorityChannel::new(),
            network_queue: Arc::new(PriorityChannel::new()),
            default_charset: options.default_charset,
            shutdown: CancellationToken::new(),
            in_flight: DashMap::new(),
            sequence: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            pool_size: options.pool_size.max(1),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns the cache worker and the network workers on the current runtime.
    ///
    /// Calling it again while workers are running does nothing, and a stopped
    /// queue cannot be restarted.
    #[instrument(skip(self), fields(pool_size = self.pool_size))]
    pub fn start(&self) {
        let mut workers = self.lock_workers();
        if !workers.is_empty() {
            warn!("request queue already started");
            return;
        }
        if self.shared.shutdown.is_cancelled() {
            warn!("request queue was stopped; not restarting");
            return;
        }

        workers.push(tokio::spawn(cache_dispatcher::run(Arc::clone(&self.shared))));
        for worker in 0..self.pool_size {
            workers.push(tokio::spawn(network_dispatcher::run(
                Arc::clone(&self.shared),
                worker,
            )));
        }
        debug!(workers = workers.len(), "request queue started");
    }

    /// Admits a request and returns it.
    ///
    /// A request can be admitted once; adding it again is ignored.
    #[instrument(skip(self, request), fields(url = request.url(), priority = ?request.priority()))]
    pub fn add<T: Send + 'static>(&self, request: Arc<Request<T>>) -> Arc<Request<T>> {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        if !request.core().admit(sequence) {
            warn!("request already admitted; ignoring");
            return request;
        }

        let dispatch: Arc<dyn Dispatch> = request.clone();
        self.shared.in_flight.insert(sequence, Arc::clone(&dispatch));

        if self.shared.cache.is_some() && request.core().should_cache() {
            self.shared.cache_queue.push(dispatch);
        } else {
            self.shared.network_queue.push(dispatch);
        }
        debug!(sequence, "request admitted");
        request
    }

    /// Cancels every queued or in-flight request tagged `tag`. Returns how many.
    pub fn cancel_all(&self, tag: &str) -> usize {
        self.cancel_all_matching(|core| core.tag() == Some(tag))
    }

    /// Cancels every queued or in-flight request matching `filter`. Returns how many.
    pub fn cancel_all_matching(&self, filter: impl Fn(&RequestCore) -> bool) -> usize {
        let mut cancelled = 0;
        for entry in &self.shared.in_flight {
            let core = entry.value().core();
            if filter(core) {
                core.cancel();
                cancelled += 1;
            }
        }
        debug!(cancelled, "bulk cancel");
        cancelled
    }

    /// Drops in-flight bookkeeping for a request that reached a terminal state.
    ///
    /// Workers call this themselves; it is public for requests settled outside
    /// the pipeline.
    pub fn finish(&self, request: &RequestCore) {
        self.shared.finish(request);
    }

    /// Number of admitted requests that have not reached a terminal state.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Number of network workers.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// The configured cache chain.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<CacheChain>> {
        self.shared.cache.as_ref()
    }

    /// The delivery used for callbacks.
    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        &self.shared.delivery
    }

    /// Signals every worker to stop and waits for them to exit.
    ///
    /// Workers finish the request they are processing; queued requests are
    /// abandoned without callbacks.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let workers: Vec<_> = self.lock_workers().drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "worker exited abnormally");
            }
        }
        debug!("request queue stopped");
    }

    /// Token cancelled by [`stop`](Self::stop).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
