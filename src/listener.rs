//! Lifecycle callbacks for a request.
//!
//! Every method has an empty default, so an implementor overrides only the
//! events it cares about. All callbacks run on the delivery context, never on
//! a worker.

use crate::error::RequestError;

/// Receives the lifecycle events of one request.
///
/// `on_pre_execute`, `on_cancel` and `on_finish` fire at most once per
/// request. `on_success` and `on_error` may both fire for one request when a
/// stale cache hit is delivered before the refreshing network result.
pub trait Listener<T>: Send + Sync {
    /// The request was taken by a worker.
    fn on_pre_execute(&self) {}

    /// The request is about to go to the network.
    fn on_networking(&self) {}

    /// The result came from a cache tier.
    fn on_used_cache(&self) {}

    /// A failed attempt is being retried.
    fn on_retry(&self) {}

    /// A parsed result is available.
    fn on_success(&self, _response: T) {}

    /// The request failed.
    fn on_error(&self, _error: RequestError) {}

    /// The request was cancelled.
    fn on_cancel(&self) {}

    /// The request reached a terminal state.
    fn on_finish(&self) {}

    /// Transfer progress, in bytes.
    fn on_progress_change(&self, _file_size: u64, _downloaded: u64) {}
}

/// Lifecycle events that carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    PreExecute,
    Networking,
    UsedCache,
    Retry,
    Cancel,
    Finish,
    Progress { total: u64, done: u64 },
}

impl Signal {
    /// Invokes the listener method matching this signal.
    pub(crate) fn notify<T>(self, listener: &dyn Listener<T>) {
        match self {
            Self::PreExecute => listener.on_pre_execute(),
            Self::Networking => listener.on_networking(),
            Self::UsedCache => listener.on_used_cache(),
            Self::Retry => listener.on_retry(),
            Self::Cancel => listener.on_cancel(),
            Self::Finish => listener.on_finish(),
            Self::Progress { total, done } => listener.on_progress_change(total, done),
        }
    }
}
