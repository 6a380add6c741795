//! Network worker loop.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::queue::QueueShared;

/// Performs requests from the network queue until shutdown.
///
/// A request is processed to completion before the next is taken; shutdown
/// interrupts only the idle wait.
#[instrument(skip(shared))]
pub(crate) async fn run(shared: Arc<QueueShared>, worker: usize) {
    debug!("network dispatcher started");
    while let Some(request) = shared.network_queue.pop(&shared.shutdown).await {
        request.perform(Arc::clone(&shared)).await;
    }
    debug!("network dispatcher stopped");
}
