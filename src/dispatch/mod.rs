//! Worker loops of the two-stage pipeline.
//!
//! One cache worker triages admitted requests; a pool of network workers
//! performs them. Both stages see requests as `Arc<dyn Dispatch>` so a single
//! queue can hold requests of every result type.

pub(crate) mod cache_dispatcher;
pub(crate) mod network_dispatcher;
pub(crate) mod performer;

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::RequestError;
use crate::listener::Signal;
use crate::queue::QueueShared;
use crate::request::{Request, RequestCore};

/// Type-erased view of a [`Request`].
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn core(&self) -> &RequestCore;

    fn notify(&self, signal: Signal);

    fn notify_error(&self, error: RequestError);

    /// Runs the cache stage for this request.
    fn triage(self: Arc<Self>, shared: Arc<QueueShared>) -> BoxFuture<'static, ()>;

    /// Runs the network stage for this request.
    fn perform(self: Arc<Self>, shared: Arc<QueueShared>) -> BoxFuture<'static, ()>;
}

impl<T: Send + 'static> Dispatch for Request<T> {
    fn core(&self) -> &RequestCore {
        &self.core
    }

    fn notify(&self, signal: Signal) {
        self.deliver_signal(signal);
    }

    fn notify_error(&self, error: RequestError) {
        self.deliver_result(Err(error));
    }

    fn triage(self: Arc<Self>, shared: Arc<QueueShared>) -> BoxFuture<'static, ()> {
        Box::pin(cache_dispatcher::triage(self, shared))
    }

    fn perform(self: Arc<Self>, shared: Arc<QueueShared>) -> BoxFuture<'static, ()> {
        Box::pin(performer::perform(self, shared))
    }
}
