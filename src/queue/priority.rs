//! Blocking priority channel feeding a pipeline stage.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatch;

struct Queued(Arc<dyn Dispatch>);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap pops the greatest element; the greatest is the one dispatched first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.core().dispatch_cmp(self.0.core())
    }
}

/// Unbounded queue ordered by priority, then admission sequence.
#[derive(Default)]
pub(crate) struct PriorityChannel {
    heap: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
}

impl PriorityChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, request: Arc<dyn Dispatch>) {
        self.lock().push(Queued(request));
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<Arc<dyn Dispatch>> {
        self.lock().pop().map(|queued| queued.0)
    }

    /// Waits for the next request. Returns `None` once `shutdown` fires.
    pub(crate) async fn pop(&self, shutdown: &CancellationToken) -> Option<Arc<dyn Dispatch>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before checking so a concurrent push is not missed
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(request) = self.try_pop() {
                return Some(request);
            }

            tokio::select! {
                () = &mut notified => {}
                () = shutdown.cancelled() => return None,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Queued>> {
        self.heap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
