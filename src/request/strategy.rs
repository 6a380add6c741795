//! Pluggable per-request behavior.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AsHeaderName, HeaderMap};
use tokio_util::sync::CancellationToken;

use super::{NetworkResponse, Priority, Response};
use crate::error::RequestError;
use crate::network::RawResponse;
use crate::retry::RetryPolicy;

/// Whether a request's successful responses may be written to the cache chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Cache when the request sets a time-to-live.
    #[default]
    Allowed,
    /// Never read from or write to the cache, whatever the request says.
    Never,
}

/// Behavior that varies between request kinds.
///
/// A strategy decides how a 2xx body is consumed, how the collected bytes
/// become a typed value, and the defaults for priority and caching. It is
/// shared by every attempt of one request.
#[async_trait]
pub trait RequestStrategy: Send + Sync + 'static {
    /// Typed result delivered to `Listener::on_success`.
    type Output: Send + 'static;

    /// Default scheduling priority.
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Whether responses may be cached.
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Allowed
    }

    /// Retry policy used when the builder does not set one.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Adjusts headers before every attempt to `url`, retries included.
    async fn prepare(&self, _url: &str, _headers: &mut HeaderMap) -> Result<(), RequestError> {
        Ok(())
    }

    /// Consumes a 2xx response body. The default collects it into memory.
    async fn handle_response(
        &self,
        response: RawResponse,
        _transfer: &TransferContext<'_>,
    ) -> Result<Bytes, RequestError> {
        response.into_bytes().await
    }

    /// Turns the collected body of the request to `url` into a typed response.
    async fn parse(
        &self,
        url: &str,
        response: &NetworkResponse,
    ) -> Result<Response<Self::Output>, RequestError>;
}

/// What a strategy may observe and emit while consuming a body.
pub struct TransferContext<'a> {
    url: &'a str,
    headers: &'a HeaderMap,
    cancel: &'a CancellationToken,
    progress: &'a (dyn Fn(u64, u64) + Send + Sync),
}

impl<'a> TransferContext<'a> {
    pub(crate) fn new(
        url: &'a str,
        headers: &'a HeaderMap,
        cancel: &'a CancellationToken,
        progress: &'a (dyn Fn(u64, u64) + Send + Sync),
    ) -> Self {
        Self {
            url,
            headers,
            cancel,
            progress,
        }
    }

    /// URL of the request being transferred.
    #[must_use]
    pub fn url(&self) -> &str {
        self.url
    }

    /// A header as sent on this attempt, after [`RequestStrategy::prepare`].
    #[must_use]
    pub fn request_header(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// True once the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Posts a progress event to the delivery context.
    pub fn report_progress(&self, total: u64, done: u64) {
        (self.progress)(total, done);
    }
}
