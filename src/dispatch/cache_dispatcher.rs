//! Cache triage worker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, instrument, warn};

use super::Dispatch;
use crate::error::panic_message;
use crate::queue::QueueShared;
use crate::request::{NetworkResponse, Request};

/// Worker loop: initializes the cache chain, then triages requests until shutdown.
pub(crate) async fn run(shared: Arc<QueueShared>) {
    if let Some(cache) = &shared.cache {
        cache.initialize().await;
    }
    debug!("cache dispatcher started");

    while let Some(request) = shared.cache_queue.pop(&shared.shutdown).await {
        request.triage(Arc::clone(&shared)).await;
    }
    debug!("cache dispatcher stopped");
}

/// Resolves one request from cache or forwards it to the network queue.
#[instrument(skip_all, fields(url = request.url(), sequence = request.sequence()))]
pub(crate) async fn triage<T: Send + 'static>(request: Arc<Request<T>>, shared: Arc<QueueShared>) {
    let dispatch: Arc<dyn Dispatch> = request.clone();
    debug!("cache-queue-take");
    shared.delivery.post_pre_execute(&dispatch);

    if request.is_cancelled() {
        debug!("cache-discard-cancelled");
        shared.delivery.post_cancel(&dispatch);
        shared.delivery.post_finish(&dispatch);
        shared.finish(request.core());
        return;
    }

    let core = request.core();
    let entry = match &shared.cache {
        Some(cache) => cache.get_entry(core.cache_key(), core.cache_sequence()).await,
        None => None,
    };
    let Some(entry) = entry else {
        debug!("cache-miss");
        forward_to_network(&shared, dispatch);
        return;
    };
    if entry.is_expired() {
        debug!("cache-hit-expired");
        forward_to_network(&shared, dispatch);
        return;
    }

    debug!("cache-hit");
    let cached = NetworkResponse::from_cache(&entry);
    let parsed = AssertUnwindSafe(request.strategy.parse(core.url(), &cached))
        .catch_unwind()
        .await;
    let mut response = match parsed {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            warn!(%error, "cached entry failed to parse; refetching");
            discard_entry(&shared, &request).await;
            forward_to_network(&shared, dispatch);
            return;
        }
        Err(payload) => {
            warn!(
                panic = %panic_message(payload.as_ref()),
                "parsing cached entry panicked; refetching"
            );
            discard_entry(&shared, &request).await;
            forward_to_network(&shared, dispatch);
            return;
        }
    };
    debug!("cache-hit-parsed");
    shared.delivery.post_used_cache(&dispatch);
    core.mark_delivered();

    if !entry.refresh_needed() {
        shared.delivery.post_response(Arc::clone(&request), response, None);
        shared.finish(request.core());
        return;
    }

    debug!("cache-hit-refresh-needed");
    response.mark_intermediate();
    let network_queue = Arc::clone(&shared.network_queue);
    let refresh = Arc::clone(&dispatch);
    shared.delivery.post_response(
        request,
        response,
        Some(Box::new(move || network_queue.push(refresh))),
    );
}

fn forward_to_network(shared: &QueueShared, request: Arc<dyn Dispatch>) {
    shared.delivery.post_networking(&request);
    shared.network_queue.push(request);
}

async fn discard_entry<T>(shared: &QueueShared, request: &Request<T>) {
    if let Some(cache) = &shared.cache {
        let core = request.core();
        cache.remove_entry(core.cache_key(), core.cache_sequence()).await;
    }
}
