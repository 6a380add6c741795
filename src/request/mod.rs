//! Request model.
//!
//! # Overview
//!
//! A [`Request`] pairs the scheduling metadata every request carries
//! ([`RequestCore`]) with a [`RequestStrategy`] that decides how the response
//! body becomes a typed value, and an optional [`Listener`] receiving the
//! lifecycle callbacks.
//!
//! Requests are built with [`RequestBuilder`] and shared as `Arc<Request<T>>`:
//! the caller keeps a handle to cancel it while the queue and its workers
//! process it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use fetchq_core::request::{Priority, Request, StringStrategy};
//!
//! let request = Request::builder("https://example.com/feed", StringStrategy::new())
//!     .tag("feeds")
//!     .priority(Priority::High)
//!     .cache_ttl(Duration::from_secs(60))
//!     .build();
//!
//! assert_eq!(request.priority(), Priority::High);
//! assert!(request.core().should_cache());
//! ```

mod download;
mod json;
mod response;
mod strategy;
mod string;

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::cache::TierId;
use crate::error::RequestError;
use crate::listener::{Listener, Signal};
use crate::retry::RetryPolicy;

pub use download::FileDownloadStrategy;
pub use json::JsonStrategy;
pub use reqwest::Method;
pub use response::{NetworkResponse, Response};
pub use strategy::{CachePolicy, RequestStrategy, TransferContext};
pub use string::{StringStrategy, decode_text};

/// Content type used for form-encoded bodies.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

/// Scheduling priority. Higher priorities are always dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background work such as file downloads.
    Low,
    /// Ordinary requests.
    #[default]
    Normal,
    /// User-visible requests.
    High,
    /// Dispatched before everything else.
    Immediate,
}

/// Scheduling metadata shared by every request regardless of its result type.
#[derive(Debug)]
pub struct RequestCore {
    method: Method,
    url: String,
    headers: Mutex<HeaderMap>,
    body: Option<Bytes>,
    priority: Priority,
    tag: Option<String>,
    cache_key: String,
    cache_sequence: Vec<TierId>,
    cache_ttl: Option<Duration>,
    cache_refresh_after: Option<Duration>,
    retry_policy: Mutex<RetryPolicy>,
    sequence: OnceLock<u64>,
    admitted_at: OnceLock<Instant>,
    cancel: CancellationToken,
    delivered: AtomicBool,
    pre_execute_delivered: AtomicBool,
    cancel_delivered: AtomicBool,
    finish_delivered: AtomicBool,
}

impl RequestCore {
    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Snapshot of the current headers.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        self.lock_headers().clone()
    }

    /// Returns a header value when present and valid ASCII.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.lock_headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// Adds or replaces a header. Takes effect on the next attempt.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.lock_headers().insert(name, value);
    }

    /// Removes a header.
    pub fn remove_header(&self, name: &HeaderName) {
        self.lock_headers().remove(name);
    }

    pub(crate) fn replace_headers(&self, headers: HeaderMap) {
        *self.lock_headers() = headers;
    }

    /// Encoded request body.
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Tag used for bulk cancellation.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Key under which responses are cached. Defaults to the URL.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Cache tiers consulted and written, fastest first.
    #[must_use]
    pub fn cache_sequence(&self) -> &[TierId] {
        &self.cache_sequence
    }

    /// True when responses to this request are read from and written to the cache.
    #[must_use]
    pub fn should_cache(&self) -> bool {
        self.cache_ttl.is_some_and(|ttl| !ttl.is_zero())
    }

    /// Time-to-live applied to a cached response.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Age after which a cached response is refreshed while still being served.
    #[must_use]
    pub fn cache_refresh_after(&self) -> Option<Duration> {
        self.cache_refresh_after
    }

    /// Sequence number assigned at admission.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.sequence.get().copied()
    }

    /// Time since admission, if admitted.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.admitted_at.get().map(Instant::elapsed)
    }

    /// Snapshot of the retry policy state.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.lock_retry_policy().clone()
    }

    pub(crate) fn lock_retry_policy(&self) -> MutexGuard<'_, RetryPolicy> {
        self.retry_policy
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Socket timeout of the next attempt.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.lock_retry_policy().current_timeout()
    }

    /// Marks the request cancelled. Workers observe it at their next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once a network response has been handed to delivery.
    #[must_use]
    pub fn has_had_response_delivered(&self) -> bool {
        self.delivered.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn mark_delivered(&self) {
        self.delivered.store(true, AtomicOrdering::SeqCst);
    }

    /// Records admission. Returns false when the request was already admitted.
    pub(crate) fn admit(&self, sequence: u64) -> bool {
        if self.sequence.set(sequence).is_err() {
            return false;
        }
        let _ = self.admitted_at.set(Instant::now());
        true
    }

    /// Dispatch order: `Less` means `self` is serviced before `other`.
    ///
    /// Higher priority first; within a priority, lower sequence first.
    #[must_use]
    pub fn dispatch_cmp(&self, other: &RequestCore) -> Ordering {
        other.priority.cmp(&self.priority).then_with(|| {
            let mine = self.sequence().unwrap_or(u64::MAX);
            let theirs = other.sequence().unwrap_or(u64::MAX);
            mine.cmp(&theirs)
        })
    }

    /// Claims a once-only signal; false when it was already delivered.
    fn claim(&self, signal: Signal) -> bool {
        let flag = match signal {
            Signal::PreExecute => &self.pre_execute_delivered,
            Signal::Cancel => &self.cancel_delivered,
            Signal::Finish => &self.finish_delivered,
            _ => return true,
        };
        !flag.swap(true, AtomicOrdering::SeqCst)
    }

    fn lock_headers(&self) -> MutexGuard<'_, HeaderMap> {
        self.headers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A request producing a `T`.
pub struct Request<T> {
    pub(crate) core: RequestCore,
    pub(crate) strategy: Box<dyn RequestStrategy<Output = T>>,
    listener: Option<Arc<dyn Listener<T>>>,
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.core.method)
            .field("url", &self.core.url)
            .field("priority", &self.core.priority)
            .field("sequence", &self.core.sequence())
            .field("cancelled", &self.core.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Request<T> {
    /// Starts building a GET request to `url` using `strategy`.
    pub fn builder<S>(url: impl Into<String>, strategy: S) -> RequestBuilder<T>
    where
        S: RequestStrategy<Output = T>,
    {
        RequestBuilder::new(url.into(), Box::new(strategy))
    }
}

impl<T> Request<T> {
    /// Scheduling metadata.
    #[must_use]
    pub fn core(&self) -> &RequestCore {
        &self.core
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        self.core.url()
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.core.priority()
    }

    /// Sequence number assigned at admission.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.core.sequence()
    }

    /// Marks the request cancelled.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Delivers a lifecycle signal to the listener, honoring once-only signals.
    pub(crate) fn deliver_signal(&self, signal: Signal) {
        if !self.core.claim(signal) {
            return;
        }
        if let Some(listener) = &self.listener {
            signal.notify(listener.as_ref());
        }
    }

    pub(crate) fn deliver_result(&self, result: Result<T, RequestError>) {
        let Some(listener) = &self.listener else {
            return;
        };
        match result {
            Ok(value) => listener.on_success(value),
            Err(error) => listener.on_error(error),
        }
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder<T> {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    priority: Option<Priority>,
    tag: Option<String>,
    cache_key: Option<String>,
    cache_sequence: Vec<TierId>,
    cache_ttl: Option<Duration>,
    cache_refresh_after: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    cancel: Option<CancellationToken>,
    strategy: Box<dyn RequestStrategy<Output = T>>,
    listener: Option<Arc<dyn Listener<T>>>,
}

impl<T: Send + 'static> RequestBuilder<T> {
    fn new(url: String, strategy: Box<dyn RequestStrategy<Output = T>>) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            priority: None,
            tag: None,
            cache_key: None,
            cache_sequence: vec![TierId::MEMORY, TierId::DISK],
            cache_ttl: None,
            cache_refresh_after: None,
            retry_policy: None,
            cancel: None,
            strategy,
            listener: None,
        }
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds or replaces a header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a raw body and its content type.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>, content_type: HeaderValue) -> Self {
        self.body = Some(body.into());
        self.headers.insert(CONTENT_TYPE, content_type);
        self
    }

    /// Sets a form-encoded body.
    #[must_use]
    pub fn form<I, K, V>(self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        self.body(encoded, HeaderValue::from_static(FORM_CONTENT_TYPE))
    }

    /// Overrides the strategy's default priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the tag used by bulk cancellation.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Overrides the cache key (defaults to the URL).
    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Sets the cache tiers to consult and write, fastest first.
    #[must_use]
    pub fn cache_sequence(mut self, sequence: impl Into<Vec<TierId>>) -> Self {
        self.cache_sequence = sequence.into();
        self
    }

    /// Caches successful responses for `ttl`. Ignored by strategies that never cache.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Serves cached responses older than `after` but refreshes them from the network.
    #[must_use]
    pub fn cache_refresh_after(mut self, after: Duration) -> Self {
        self.cache_refresh_after = Some(after);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Uses `token` as the request's cancellation flag.
    ///
    /// Cancelling the token cancels the request; pass a child token to tie the
    /// request to a wider scope.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Sets the listener receiving lifecycle callbacks.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn Listener<T>>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Builds the request.
    #[must_use]
    pub fn build(self) -> Arc<Request<T>> {
        let cacheable = self.strategy.cache_policy() == CachePolicy::Allowed;
        let priority = self.priority.unwrap_or_else(|| self.strategy.priority());
        let core = RequestCore {
            cache_key: self.cache_key.unwrap_or_else(|| self.url.clone()),
            method: self.method,
            url: self.url,
            headers: Mutex::new(self.headers),
            body: self.body,
            priority,
            tag: self.tag,
            cache_sequence: self.cache_sequence,
            cache_ttl: self.cache_ttl.filter(|_| cacheable),
            cache_refresh_after: self.cache_refresh_after.filter(|_| cacheable),
            retry_policy: Mutex::new(
                self.retry_policy
                    .unwrap_or_else(|| self.strategy.retry_policy()),
            ),
            sequence: OnceLock::new(),
            admitted_at: OnceLock::new(),
            cancel: self.cancel.unwrap_or_default(),
            delivered: AtomicBool::new(false),
            pre_execute_delivered: AtomicBool::new(false),
            cancel_delivered: AtomicBool::new(false),
            finish_delivered: AtomicBool::new(false),
        };
        Arc::new(Request {
            core,
            strategy: self.strategy,
            listener: self.listener,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn request(priority: Priority) -> Arc<Request<String>> {
        Request::builder("http://example.com", StringStrategy::new())
            .priority(priority)
            .build()
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_priority_enum_order() {
        assert!(Priority::Immediate > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_higher_priority_dispatched_first_regardless_of_sequence() {
        let low = request(Priority::Low);
        let high = request(Priority::High);
        low.core.admit(1);
        high.core.admit(2);

        assert_eq!(high.core.dispatch_cmp(&low.core), Ordering::Less);
        assert_eq!(low.core.dispatch_cmp(&high.core), Ordering::Greater);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let first = request(Priority::Normal);
        let second = request(Priority::Normal);
        first.core.admit(10);
        second.core.admit(11);

        assert_eq!(first.core.dispatch_cmp(&second.core), Ordering::Less);
        assert_eq!(first.core.dispatch_cmp(&first.core), Ordering::Equal);
    }

    #[test]
    fn test_admit_only_once() {
        let request = request(Priority::Normal);
        assert!(request.core.admit(3));
        assert!(!request.core.admit(4));
        assert_eq!(request.sequence(), Some(3));
        assert!(request.core.age().is_some());
    }

    // ==================== Builder Tests ====================

    #[test]
    fn test_defaults() {
        let request = Request::builder("http://example.com/a", StringStrategy::new()).build();
        let core = request.core();

        assert_eq!(*core.method(), Method::GET);
        assert_eq!(core.cache_key(), "http://example.com/a");
        assert_eq!(core.cache_sequence(), &[TierId::MEMORY, TierId::DISK]);
        assert_eq!(core.priority(), Priority::Normal);
        assert!(!core.should_cache());
        assert!(core.sequence().is_none());
        assert_eq!(core.timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_form_body_is_encoded() {
        let request = Request::builder("http://example.com", StringStrategy::new())
            .method(Method::POST)
            .form([("q", "rust lang"), ("page", "2")])
            .build();

        assert_eq!(
            request.core().body().unwrap().as_ref(),
            b"q=rust+lang&page=2"
        );
        assert_eq!(
            request.core().header("content-type").as_deref(),
            Some(FORM_CONTENT_TYPE)
        );
    }

    #[test]
    fn test_zero_ttl_does_not_cache() {
        let request = Request::builder("http://example.com", StringStrategy::new())
            .cache_ttl(Duration::ZERO)
            .build();
        assert!(!request.core().should_cache());
    }

    #[test]
    fn test_set_header_replaces_existing() {
        let request = request(Priority::Normal);
        request
            .core()
            .set_header(reqwest::header::RANGE, HeaderValue::from_static("bytes=0-"));
        request
            .core()
            .set_header(reqwest::header::RANGE, HeaderValue::from_static("bytes=10-"));
        assert_eq!(request.core().header("range").as_deref(), Some("bytes=10-"));
        assert_eq!(request.core().headers().len(), 1);
    }

    // ==================== Signal Tests ====================

    #[derive(Default)]
    struct Counter {
        pre_execute: AtomicUsize,
        finish: AtomicUsize,
        networking: AtomicUsize,
    }

    impl Listener<String> for Counter {
        fn on_pre_execute(&self) {
            self.pre_execute.fetch_add(1, AtomicOrdering::SeqCst);
        }
        fn on_networking(&self) {
            self.networking.fetch_add(1, AtomicOrdering::SeqCst);
        }
        fn on_finish(&self) {
            self.finish.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn test_once_only_signals_fire_once() {
        let counter = Arc::new(Counter::default());
        let request = Request::builder("http://example.com", StringStrategy::new())
            .listener(counter.clone())
            .build();

        request.deliver_signal(Signal::PreExecute);
        request.deliver_signal(Signal::PreExecute);
        request.deliver_signal(Signal::Networking);
        request.deliver_signal(Signal::Networking);
        request.deliver_signal(Signal::Finish);
        request.deliver_signal(Signal::Finish);

        assert_eq!(counter.pre_execute.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(counter.networking.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(counter.finish.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let request = request(Priority::Normal);
        assert!(!request.is_cancelled());
        request.cancel();
        request.cancel();
        assert!(request.is_cancelled());
    }
}
