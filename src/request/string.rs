//! Text responses.

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use tracing::debug;

use super::{NetworkResponse, Priority, RequestStrategy, Response};
use crate::error::RequestError;

/// Decodes the body as text using the response charset.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringStrategy {
    priority: Priority,
}

impl StringStrategy {
    /// Creates a strategy with normal priority.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a strategy with the given default priority.
    #[must_use]
    pub fn with_priority(priority: Priority) -> Self {
        Self { priority }
    }
}

#[async_trait]
impl RequestStrategy for StringStrategy {
    type Output = String;

    fn priority(&self) -> Priority {
        self.priority
    }

    async fn parse(
        &self,
        _url: &str,
        response: &NetworkResponse,
    ) -> Result<Response<String>, RequestError> {
        let text = decode_text(&response.data, &response.charset);
        Ok(Response::success(text, response))
    }
}

/// Decodes `data` as `charset`.
///
/// Labels are resolved the way browsers resolve them, so `ISO-8859-1` decodes
/// as windows-1252. A byte order mark overrides the label. Unknown labels fall
/// back to UTF-8; malformed sequences become U+FFFD.
#[must_use]
pub fn decode_text(data: &[u8], charset: &str) -> String {
    let encoding = Encoding::for_label(charset.trim().as_bytes()).unwrap_or_else(|| {
        debug!(charset, "unknown charset; decoding as UTF-8");
        UTF_8
    });
    let (text, used, malformed) = encoding.decode(data);
    if malformed {
        debug!(charset = used.name(), "malformed bytes replaced while decoding");
    }
    text.into_owned()
}
