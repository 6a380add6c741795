//! Transport abstraction.
//!
//! # Overview
//!
//! A [`Network`] turns one [`HttpRequest`] into one [`RawResponse`] whose body
//! is still a stream, so a strategy can write large downloads to disk chunk by
//! chunk. The engine owns status classification, retries and cancellation;
//! a transport only reports what happened on the wire:
//!
//! - connect or read timeouts as [`RequestError::Timeout`]
//! - every other transport failure as [`RequestError::Network`]
//!
//! [`ReqwestNetwork`] is the production transport.

mod http;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap};
use reqwest::Method;

use crate::error::RequestError;

pub use http::{CONNECT_TIMEOUT_SECS, ReqwestNetwork};

/// Streaming response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, RequestError>>;

/// Fully prepared request handed to a transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Request headers, keys unique.
    pub headers: HeaderMap,
    /// Encoded body, if any.
    pub body: Option<Bytes>,
    /// Socket timeout for this attempt.
    pub timeout: Duration,
}

/// Status, headers and streaming body returned by a transport.
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: BodyStream,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RawResponse {
    /// Creates a response around an existing body stream.
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Creates a response whose body is already in memory.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let stream = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self::new(status, headers, stream)
    }

    /// Returns a header value when present and valid ASCII.
    #[must_use]
    pub fn header(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Parsed `Content-Length`.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Charset from `Content-Type`, or `default` when absent.
    #[must_use]
    pub fn charset(&self, default: &str) -> String {
        self.header(CONTENT_TYPE)
            .and_then(parse_charset)
            .unwrap_or(default)
            .to_string()
    }

    /// True when the server accepts byte ranges for this resource.
    #[must_use]
    pub fn supports_range(&self) -> bool {
        self.header(ACCEPT_RANGES) == Some("bytes")
            || self
                .header(CONTENT_RANGE)
                .is_some_and(|value| value.starts_with("bytes"))
    }

    /// Collects the whole body into memory.
    pub async fn into_bytes(mut self) -> Result<Bytes, RequestError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

/// Extracts the `charset` parameter from a `Content-Type` value.
///
/// ```
/// use fetchq_core::network::parse_charset;
///
/// assert_eq!(parse_charset("text/html; charset=GBK"), Some("GBK"));
/// assert_eq!(parse_charset("application/json"), None);
/// ```
#[must_use]
pub fn parse_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        (name.trim().eq_ignore_ascii_case("charset") && !value.is_empty())
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Performs one HTTP exchange.
#[async_trait]
pub trait Network: Send + Sync {
    /// Sends `request` and returns the status, headers and body stream.
    ///
    /// Non-2xx statuses are returned as responses, not errors.
    async fn perform(&self, request: &HttpRequest) -> Result<RawResponse, RequestError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    // ==================== Charset Tests ====================

    #[test]
    fn test_parse_charset_variants() {
        assert_eq!(parse_charset("text/plain; charset=ISO-8859-1"), Some("ISO-8859-1"));
        assert_eq!(parse_charset("text/plain;charset=\"utf-8\""), Some("utf-8"));
        assert_eq!(parse_charset("text/plain; format=flowed; CHARSET=big5"), Some("big5"));
        assert_eq!(parse_charset("charset=utf-8"), None);
        assert_eq!(parse_charset("text/plain; charset="), None);
    }

    #[test]
    fn test_charset_falls_back_to_default() {
        let response = RawResponse::from_bytes(200, headers(&[]), "x");
        assert_eq!(response.charset("UTF-8"), "UTF-8");

        let response = RawResponse::from_bytes(
            200,
            headers(&[("content-type", "text/html; charset=GBK")]),
            "x",
        );
        assert_eq!(response.charset("UTF-8"), "GBK");
    }

    // ==================== Range Tests ====================

    #[test]
    fn test_supports_range() {
        let accept = RawResponse::from_bytes(200, headers(&[("accept-ranges", "bytes")]), "");
        assert!(accept.supports_range());

        let content_range = RawResponse::from_bytes(
            206,
            headers(&[("content-range", "bytes 10-19/20")]),
            "",
        );
        assert!(content_range.supports_range());

        let none = RawResponse::from_bytes(200, headers(&[("accept-ranges", "none")]), "");
        assert!(!none.supports_range());
    }

    #[test]
    fn test_content_length() {
        let response = RawResponse::from_bytes(200, headers(&[("content-length", "42")]), "");
        assert_eq!(response.content_length(), Some(42));
        assert_eq!(
            RawResponse::from_bytes(200, headers(&[]), "").content_length(),
            None
        );
    }

    #[tokio::test]
    async fn test_into_bytes_concatenates_chunks() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ])
        .boxed();
        let response = RawResponse::new(200, HeaderMap::new(), body);
        assert_eq!(response.into_bytes().await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn test_into_bytes_propagates_stream_error() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(RequestError::timeout("http://x")),
        ])
        .boxed();
        let response = RawResponse::new(200, HeaderMap::new(), body);
        assert!(matches!(
            response.into_bytes().await,
            Err(RequestError::Timeout { .. })
        ));
    }
}
