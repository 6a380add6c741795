//! Raw and typed responses.

use bytes::Bytes;

use crate::cache::CacheEntry;
use crate::error::RequestError;

/// Status, body bytes, and charset of a completed HTTP exchange.
///
/// Also synthesized from a cache entry when a request is served from cache,
/// in which case the status is always 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub data: Bytes,
    /// Charset parsed from `Content-Type`, or the configured default.
    pub charset: String,
}

impl NetworkResponse {
    /// Creates a response.
    pub fn new(status: u16, data: Bytes, charset: impl Into<String>) -> Self {
        Self {
            status,
            data,
            charset: charset.into(),
        }
    }

    /// Rebuilds a 200 response from a cached entry.
    #[must_use]
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self::new(200, entry.data.clone(), entry.charset.clone())
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Typed outcome of parsing a [`NetworkResponse`].
///
/// A successful response optionally carries the cache entry to store. An
/// intermediate response is a stale cache hit delivered while a refresh is
/// still in flight; the request's final outcome follows it.
#[derive(Debug)]
pub struct Response<T> {
    result: Result<T, RequestError>,
    cache_entry: Option<CacheEntry>,
    intermediate: bool,
}

impl<T> Response<T> {
    /// Successful result whose body may be cached.
    pub fn success(result: T, response: &NetworkResponse) -> Self {
        Self {
            result: Ok(result),
            cache_entry: Some(CacheEntry::new(
                response.data.clone(),
                response.charset.clone(),
            )),
            intermediate: false,
        }
    }

    /// Successful result that must never be cached.
    pub fn uncached(result: T) -> Self {
        Self {
            result: Ok(result),
            cache_entry: None,
            intermediate: false,
        }
    }

    /// Failed result.
    pub fn error(error: RequestError) -> Self {
        Self {
            result: Err(error),
            cache_entry: None,
            intermediate: false,
        }
    }

    /// Returns true when the result is a value rather than an error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns true when a final response will follow this one.
    #[must_use]
    pub fn is_intermediate(&self) -> bool {
        self.intermediate
    }

    /// The parsed value or the error.
    #[must_use]
    pub fn result(&self) -> &Result<T, RequestError> {
        &self.result
    }

    /// The entry to write to the cache chain, if any.
    #[must_use]
    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cache_entry.as_ref()
    }

    pub(crate) fn cache_entry_mut(&mut self) -> Option<&mut CacheEntry> {
        self.cache_entry.as_mut()
    }

    pub(crate) fn mark_intermediate(&mut self) {
        self.intermediate = true;
    }

    /// Consumes the response, returning the parsed value or the error.
    pub fn into_result(self) -> Result<T, RequestError> {
        self.result
    }
}
