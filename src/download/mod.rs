//! Bounded-parallelism file download scheduler.
//!
//! [`FileDownloader`] sits on top of a [`RequestQueue`] and limits how many
//! downloads are in flight at once. Every task is tracked by a
//! [`DownloadController`] that can pause, resume or discard it; paused tasks
//! keep their partial `.tmp` file and continue from its length when resumed.
//!
//! The parallelism limit must stay below the queue's worker count so that one
//! network worker is always free for ordinary requests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchq_core::download::FileDownloader;
//! use fetchq_core::listener::Listener;
//! use fetchq_core::RequestQueue;
//!
//! struct Quiet;
//! impl Listener<std::path::PathBuf> for Quiet {}
//!
//! # fn example(queue: RequestQueue) -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = FileDownloader::new(queue, 2)?;
//! let task = downloader.add("/tmp/big.iso", "https://example.com/big.iso", Arc::new(Quiet));
//! task.pause();
//! task.resume();
//! # Ok(())
//! # }
//! ```

mod controller;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::listener::Listener;
use crate::queue::RequestQueue;
use crate::request::{FileDownloadStrategy, Request, RequestBuilder};
use crate::retry::{DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_TIMEOUT, DOWNLOAD_MAX_RETRIES, RetryPolicy};

pub use controller::{DownloadController, DownloadStatus};

use controller::{ControllerListener, ControllerShared};

/// Errors raised when constructing a [`FileDownloader`].
#[derive(Debug, Error)]
pub enum DownloaderError {
    /// The parallelism limit would occupy every network worker.
    #[error(
        "download parallelism {parallelism} must be at least 1 and below the queue's {pool_size} workers"
    )]
    InvalidParallelism {
        /// Requested number of concurrent downloads.
        parallelism: usize,
        /// Network workers available in the queue.
        pool_size: usize,
    },
}

/// Schedules file downloads onto a [`RequestQueue`].
///
/// Cloning the handle shares the same task list.
#[derive(Clone)]
pub struct FileDownloader {
    inner: Arc<DownloaderInner>,
}

pub(crate) struct DownloaderInner {
    queue: RequestQueue,
    parallelism: usize,
    retry_policy: RetryPolicy,
    tasks: Mutex<Vec<Arc<ControllerShared>>>,
}

impl std::fmt::Debug for FileDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownloader")
            .field("parallelism", &self.inner.parallelism)
            .field("tasks", &self.task_count())
            .finish_non_exhaustive()
    }
}

impl FileDownloader {
    /// Creates a downloader allowing `parallelism` concurrent transfers.
    ///
    /// Each download retries up to [`DOWNLOAD_MAX_RETRIES`] times.
    ///
    /// # Errors
    ///
    /// Returns [`DownloaderError::InvalidParallelism`] when `parallelism` is
    /// zero or not strictly below the queue's worker count.
    pub fn new(queue: RequestQueue, parallelism: usize) -> Result<Self, DownloaderError> {
        let retry_policy =
            RetryPolicy::new(DEFAULT_TIMEOUT, DOWNLOAD_MAX_RETRIES, DEFAULT_BACKOFF_MULTIPLIER);
        Self::with_retry_policy(queue, parallelism, retry_policy)
    }

    /// Like [`new`](Self::new), with the retry policy given to each download request.
    ///
    /// # Errors
    ///
    /// Returns [`DownloaderError::InvalidParallelism`] as [`new`](Self::new) does.
    pub fn with_retry_policy(
        queue: RequestQueue,
        parallelism: usize,
        retry_policy: RetryPolicy,
    ) -> Result<Self, DownloaderError> {
        let pool_size = queue.pool_size();
        if parallelism == 0 || parallelism >= pool_size {
            return Err(DownloaderError::InvalidParallelism {
                parallelism,
                pool_size,
            });
        }
        Ok(Self {
            inner: Arc::new(DownloaderInner {
                queue,
                parallelism,
                retry_policy,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Adds a download task and schedules it if a slot is free.
    #[instrument(skip(self, store_path, url, listener), fields(store = %store_path.as_ref().display()))]
    pub fn add(
        &self,
        store_path: impl AsRef<Path>,
        url: impl Into<String>,
        listener: Arc<dyn Listener<PathBuf>>,
    ) -> DownloadController {
        let shared = Arc::new(ControllerShared::new(
            store_path.as_ref().to_path_buf(),
            url.into(),
            listener,
        ));
        self.inner.lock_tasks().push(Arc::clone(&shared));
        debug!(url = shared.url(), "download task added");
        self.inner.schedule();
        DownloadController::new(shared, Arc::downgrade(&self.inner))
    }

    /// Finds the task downloading `url` into `store_path`.
    #[must_use]
    pub fn get(&self, store_path: impl AsRef<Path>, url: &str) -> Option<DownloadController> {
        let store_path = store_path.as_ref();
        self.inner
            .lock_tasks()
            .iter()
            .find(|task| task.store_path() == store_path && task.url() == url)
            .map(|task| DownloadController::new(Arc::clone(task), Arc::downgrade(&self.inner)))
    }

    /// Discards every task, cancelling those in flight.
    pub fn clear_all(&self) {
        let tasks: Vec<_> = self.inner.lock_tasks().drain(..).collect();
        for task in &tasks {
            task.mark_discarded();
        }
        debug!(discarded = tasks.len(), "download tasks cleared");
    }

    /// Number of tasks that are not yet finished or discarded.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.lock_tasks().len()
    }

    /// Number of tasks currently holding a download slot.
    #[must_use]
    pub fn downloading_count(&self) -> usize {
        DownloaderInner::downloading_count(&self.inner.lock_tasks())
    }

    /// Maximum number of concurrent downloads.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.inner.parallelism
    }

    /// Builds the request used for one download attempt.
    #[must_use]
    pub fn build_request(
        &self,
        store_path: impl AsRef<Path>,
        url: &str,
    ) -> RequestBuilder<PathBuf> {
        self.inner.build_request(store_path.as_ref(), url)
    }
}

impl DownloaderInner {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<Arc<ControllerShared>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downloading_count(tasks: &[Arc<ControllerShared>]) -> usize {
        tasks
            .iter()
            .filter(|task| task.status() == DownloadStatus::Downloading)
            .count()
    }

    fn build_request(&self, store_path: &Path, url: &str) -> RequestBuilder<PathBuf> {
        Request::builder(url, FileDownloadStrategy::new(store_path))
            .retry_policy(self.retry_policy.clone())
    }

    /// Deploys waiting tasks, in insertion order, until the limit is reached.
    pub(crate) fn schedule(self: &Arc<Self>) {
        let tasks = self.lock_tasks();
        let mut running = Self::downloading_count(&tasks);
        for task in tasks.iter() {
            if running >= self.parallelism {
                break;
            }
            if self.deploy(task) {
                running += 1;
            }
        }
    }

    fn deploy(self: &Arc<Self>, task: &Arc<ControllerShared>) -> bool {
        let mut state = task.lock_state();
        if state.status != DownloadStatus::Waiting {
            return false;
        }
        if state.request.is_some() {
            debug!(url = task.url(), "previous request still settling");
            return false;
        }

        state.attempt += 1;
        let cancel = CancellationToken::new();
        let listener = ControllerListener::new(
            Arc::downgrade(task),
            Arc::downgrade(self),
            state.attempt,
            cancel.clone(),
            Arc::clone(task.listener()),
        );
        let request = self
            .build_request(task.store_path(), task.url())
            .cancel_token(cancel)
            .listener(Arc::new(listener))
            .build();

        state.status = DownloadStatus::Downloading;
        state.request = Some(Arc::clone(&request));
        drop(state);

        debug!(url = task.url(), "download task deployed");
        self.queue.add(request);
        true
    }

    /// Drops a task from the list and fills the freed slot.
    pub(crate) fn remove(self: &Arc<Self>, task: &Arc<ControllerShared>) {
        self.lock_tasks().retain(|other| !Arc::ptr_eq(other, task));
        self.schedule();
    }
}
