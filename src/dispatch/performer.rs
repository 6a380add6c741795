//! Network stage of a single request: attempts, retries, cache write-back and delivery.
//!
//! # Checkpoints
//!
//! Cancellation is cooperative. It is observed when the request is taken from
//! the queue, before every attempt, after every body chunk (for strategies that
//! stream), and once more before parsing. A cancelled request is settled with
//! cancel followed by finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::Dispatch;
use crate::error::{RequestError, panic_message};
use crate::network::HttpRequest;
use crate::queue::{QueueShared, SLOW_REQUEST_THRESHOLD};
use crate::request::{NetworkResponse, Request, Response, TransferContext};
use crate::retry::RetryDecision;

/// Processes one request taken from the network queue.
#[instrument(skip_all, fields(url = request.url(), sequence = request.sequence()))]
pub(crate) async fn perform<T: Send + 'static>(request: Arc<Request<T>>, shared: Arc<QueueShared>) {
    let dispatch: Arc<dyn Dispatch> = request.clone();
    debug!("network-queue-take");
    shared.delivery.post_pre_execute(&dispatch);

    if request.is_cancelled() {
        debug!("network-discard-cancelled");
        settle_cancelled(&shared, &dispatch);
        shared.finish(request.core());
        return;
    }

    let outcome = AssertUnwindSafe(execute(&request, &dispatch, &shared))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "request processing panicked");
            Err(RequestError::other(request.url(), message))
        });

    match outcome {
        Ok(response) => {
            request.core().mark_delivered();
            shared.delivery.post_response(Arc::clone(&request), response, None);
        }
        Err(RequestError::Cancelled { .. }) => {
            debug!("network-cancelled");
            settle_cancelled(&shared, &dispatch);
        }
        Err(error) => {
            debug!(kind = error.kind(), %error, "request failed");
            shared.delivery.post_error(&dispatch, error);
        }
    }
    shared.finish(request.core());
}

fn settle_cancelled(shared: &QueueShared, dispatch: &Arc<dyn Dispatch>) {
    shared.delivery.post_cancel(dispatch);
    shared.delivery.post_finish(dispatch);
}

/// Fetches, parses and caches. Errors are delivered by the caller.
async fn execute<T: Send + 'static>(
    request: &Arc<Request<T>>,
    dispatch: &Arc<dyn Dispatch>,
    shared: &QueueShared,
) -> Result<Response<T>, RequestError> {
    let network_response = perform_with_retry(request, dispatch, shared).await?;
    debug!(status = network_response.status, "network-http-complete");

    if request.is_cancelled() {
        return Err(RequestError::cancelled(request.url()));
    }

    let core = request.core();
    let mut response = request
        .strategy
        .parse(core.url(), &network_response)
        .await?;
    debug!("network-parse-complete");

    if let Some(cache) = &shared.cache
        && core.should_cache()
        && let Some(entry) = response.cache_entry_mut()
    {
        let now = std::time::SystemTime::now();
        if let Some(ttl) = core.cache_ttl() {
            entry.expire_time = now + ttl;
        }
        entry.refresh_time = core.cache_refresh_after().map(|after| now + after);
        cache
            .put_entry(core.cache_key(), entry, core.cache_sequence())
            .await;
        debug!("network-cache-written");
    }

    Ok(response)
}

/// Runs attempts until one succeeds, a non-retryable error occurs, or the policy gives up.
async fn perform_with_retry<T: Send + 'static>(
    request: &Arc<Request<T>>,
    dispatch: &Arc<dyn Dispatch>,
    shared: &QueueShared,
) -> Result<NetworkResponse, RequestError> {
    let started = Instant::now();
    loop {
        if request.is_cancelled() {
            return Err(RequestError::cancelled(request.url()));
        }

        let error = match attempt(request, dispatch, shared).await {
            Ok(response) => {
                log_slow_request(request, &response, started);
                return Ok(response);
            }
            Err(error) if error.is_retryable() => error,
            Err(error) => return Err(error),
        };

        let old_timeout = request.core().timeout();
        let decision = request.core().lock_retry_policy().should_retry(&error);
        match decision {
            RetryDecision::Retry { timeout, attempt } => {
                info!(
                    kind = error.kind(),
                    attempt,
                    old_timeout_ms = old_timeout.as_millis(),
                    timeout_ms = timeout.as_millis(),
                    "retrying request"
                );
                shared.delivery.post_retry(dispatch);
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(kind = error.kind(), %reason, "giving up");
                return Err(error);
            }
        }
    }
}

/// One network attempt, classified and consumed by the strategy.
async fn attempt<T: Send + 'static>(
    request: &Arc<Request<T>>,
    dispatch: &Arc<dyn Dispatch>,
    shared: &QueueShared,
) -> Result<NetworkResponse, RequestError> {
    let core = request.core();
    let url = core.url();

    let mut headers = core.headers();
    request.strategy.prepare(url, &mut headers).await?;
    core.replace_headers(headers.clone());

    let http_request = HttpRequest {
        method: core.method().clone(),
        url: url.to_string(),
        headers,
        body: core.body().cloned(),
        timeout: core.timeout(),
    };
    let raw = shared.network.perform(&http_request).await?;
    let status = raw.status;
    let charset = raw.charset(&shared.default_charset);

    if !(200..300).contains(&status) {
        let data = raw.into_bytes().await?;
        let response = NetworkResponse::new(status, data, charset);
        warn!(status, url, "unexpected response code");
        return Err(if matches!(status, 401 | 403) {
            RequestError::auth_failure(url, response)
        } else {
            RequestError::server(url, response)
        });
    }

    let progress_target = Arc::clone(dispatch);
    let delivery = &shared.delivery;
    let progress = move |total: u64, done: u64| {
        delivery.post_download_progress(&progress_target, total, done);
    };
    let transfer = TransferContext::new(url, &http_request.headers, core.cancel_token(), &progress);
    let data = request.strategy.handle_response(raw, &transfer).await?;

    Ok(NetworkResponse::new(status, data, charset))
}

fn log_slow_request<T>(request: &Request<T>, response: &NetworkResponse, started: Instant) {
    let lifetime = started.elapsed();
    if lifetime > SLOW_REQUEST_THRESHOLD {
        info!(
            url = request.url(),
            lifetime_ms = lifetime.as_millis(),
            size = response.data.len(),
            status = response.status,
            retries = request.core().retry_policy().current_retry_count(),
            "slow HTTP response"
        );
    }
}
