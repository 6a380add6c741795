//! Per-task download state and the listener wrapper that drives it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DownloaderInner;
use crate::error::RequestError;
use crate::listener::Listener;
use crate::request::Request;

/// Lifecycle of a download task.
///
/// `Success` and `Discarded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    /// Queued behind the parallelism limit.
    Waiting,
    /// Holding a slot; its request is in the queue or transferring.
    Downloading,
    /// Stopped by the caller; the partial file is kept.
    Paused,
    /// The request finished without being cancelled.
    Success,
    /// Removed by the caller.
    Discarded,
}

impl DownloadStatus {
    /// True for `Success` and `Discarded`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Discarded)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Success => "success",
            Self::Discarded => "discarded",
        };
        f.write_str(label)
    }
}

pub(crate) struct ControllerState {
    pub(crate) status: DownloadStatus,
    /// The last deployed request, kept until its finish callback runs even
    /// when it has been cancelled. No new request is deployed while it is set.
    pub(crate) request: Option<Arc<Request<PathBuf>>>,
    /// Number of the last deployment.
    pub(crate) attempt: u64,
}

pub(crate) struct ControllerShared {
    store_path: PathBuf,
    url: String,
    listener: Arc<dyn Listener<PathBuf>>,
    state: Mutex<ControllerState>,
}

impl ControllerShared {
    pub(crate) fn new(
        store_path: PathBuf,
        url: String,
        listener: Arc<dyn Listener<PathBuf>>,
    ) -> Self {
        Self {
            store_path,
            url,
            listener,
            state: Mutex::new(ControllerState {
                status: DownloadStatus::Waiting,
                request: None,
                attempt: 0,
            }),
        }
    }

    pub(crate) fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn listener(&self) -> &Arc<dyn Listener<PathBuf>> {
        &self.listener
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> DownloadStatus {
        self.lock_state().status
    }

    /// Cancels any active request and marks the task discarded.
    ///
    /// Returns false when the task was already terminal.
    pub(crate) fn mark_discarded(&self) -> bool {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return false;
        }
        if let Some(request) = &state.request {
            request.cancel();
        }
        state.status = DownloadStatus::Discarded;
        true
    }

    /// Forgets the request of deployment `attempt` once it has settled.
    ///
    /// Returns false when a later deployment has replaced it.
    pub(crate) fn release(&self, attempt: u64) -> bool {
        let mut state = self.lock_state();
        if state.attempt != attempt {
            return false;
        }
        state.request = None;
        true
    }
}

/// Handle to one download task.
///
/// Handles are cheap to clone and stay usable after the task finishes; state
/// changes on a terminal task are rejected.
#[derive(Clone)]
pub struct DownloadController {
    shared: Arc<ControllerShared>,
    downloader: Weak<DownloaderInner>,
}

impl fmt::Debug for DownloadController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadController")
            .field("url", &self.shared.url)
            .field("store_path", &self.shared.store_path)
            .field("status", &self.status())
            .finish()
    }
}

impl DownloadController {
    pub(crate) fn new(shared: Arc<ControllerShared>, downloader: Weak<DownloaderInner>) -> Self {
        Self { shared, downloader }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.shared.status()
    }

    /// True while the task holds a download slot.
    #[must_use]
    pub fn is_downloading(&self) -> bool {
        self.status() == DownloadStatus::Downloading
    }

    /// Final location of the file.
    #[must_use]
    pub fn store_path(&self) -> &Path {
        self.shared.store_path()
    }

    /// The URL being downloaded.
    #[must_use]
    pub fn url(&self) -> &str {
        self.shared.url()
    }

    /// Pauses a waiting or downloading task.
    ///
    /// An active transfer is cancelled and stops at its next chunk boundary,
    /// so the freed slot may briefly overlap with the next deployed task.
    /// Returns false from any other state.
    pub fn pause(&self) -> bool {
        {
            let mut state = self.shared.lock_state();
            match state.status {
                DownloadStatus::Downloading => {
                    if let Some(request) = &state.request {
                        request.cancel();
                    }
                }
                DownloadStatus::Waiting => {}
                _ => return false,
            }
            state.status = DownloadStatus::Paused;
        }
        debug!(url = self.url(), "download paused");
        self.reschedule();
        true
    }

    /// Requeues a paused task. Returns false unless the task was paused.
    ///
    /// A task paused mid-transfer stays `Waiting` until the cancelled request
    /// has written its last chunk; the next request then continues from there.
    pub fn resume(&self) -> bool {
        {
            let mut state = self.shared.lock_state();
            if state.status != DownloadStatus::Paused {
                return false;
            }
            state.status = DownloadStatus::Waiting;
        }
        debug!(url = self.url(), "download resumed");
        self.reschedule();
        true
    }

    /// Cancels and removes the task. Returns false if it was already terminal.
    ///
    /// The partial `.tmp` file is left on disk.
    pub fn discard(&self) -> bool {
        if !self.shared.mark_discarded() {
            return false;
        }
        debug!(url = self.url(), "download discarded");
        if let Some(downloader) = self.downloader.upgrade() {
            downloader.remove(&self.shared);
        }
        true
    }

    fn reschedule(&self) {
        if let Some(downloader) = self.downloader.upgrade() {
            downloader.schedule();
        }
    }
}

/// Wraps the caller's listener for one deployed request.
///
/// Once the request is cancelled its success, error and finish callbacks are
/// swallowed, so a paused or discarded attempt never reports completion. Its
/// finish still releases the task so a resumed download can be deployed.
pub(crate) struct ControllerListener {
    task: Weak<ControllerShared>,
    downloader: Weak<DownloaderInner>,
    attempt: u64,
    cancel: CancellationToken,
    inner: Arc<dyn Listener<PathBuf>>,
}

impl ControllerListener {
    pub(crate) fn new(
        task: Weak<ControllerShared>,
        downloader: Weak<DownloaderInner>,
        attempt: u64,
        cancel: CancellationToken,
        inner: Arc<dyn Listener<PathBuf>>,
    ) -> Self {
        Self {
            task,
            downloader,
            attempt,
            cancel,
            inner,
        }
    }
}

impl Listener<PathBuf> for ControllerListener {
    fn on_pre_execute(&self) {
        self.inner.on_pre_execute();
    }

    fn on_networking(&self) {
        self.inner.on_networking();
    }

    fn on_retry(&self) {
        self.inner.on_retry();
    }

    fn on_success(&self, response: PathBuf) {
        if !self.cancel.is_cancelled() {
            self.inner.on_success(response);
        }
    }

    fn on_error(&self, error: RequestError) {
        if !self.cancel.is_cancelled() {
            self.inner.on_error(error);
        }
    }

    fn on_cancel(&self) {
        self.inner.on_cancel();
    }

    fn on_finish(&self) {
        let Some(task) = self.task.upgrade() else {
            return;
        };
        if self.cancel.is_cancelled() {
            if task.release(self.attempt)
                && let Some(downloader) = self.downloader.upgrade()
            {
                downloader.schedule();
            }
            return;
        }
        {
            let mut state = task.lock_state();
            if state.attempt == self.attempt {
                state.request = None;
            }
            if state.status != DownloadStatus::Downloading {
                return;
            }
            // Errors end here too: the task leaves the scheduler either way.
            state.status = DownloadStatus::Success;
        }
        self.inner.on_finish();
        if let Some(downloader) = self.downloader.upgrade() {
            downloader.remove(&task);
        }
    }

    fn on_progress_change(&self, file_size: u64, downloaded: u64) {
        self.inner.on_progress_change(file_size, downloaded);
    }
}
