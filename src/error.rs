//! Error types for request processing.
//!
//! Every failure a request can reach is expressed as a [`RequestError`] and
//! delivered to the caller's listener; none escape a worker loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::request::NetworkResponse;

/// Boxed error used where the concrete source type belongs to a collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can terminate a request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No usable response was obtained (DNS, connection refused, reset, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Connect or socket read timed out.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Server answered 401 or 403.
    ///
    /// Carries the response so a caller can refresh credentials.
    #[error("HTTP {} (authentication failure) requesting {url}", response.status)]
    AuthFailure {
        /// The URL that was rejected.
        url: String,
        /// The rejected response, body included.
        response: NetworkResponse,
    },

    /// Server answered with any other non-2xx status.
    #[error("HTTP {} requesting {url}", response.status)]
    Server {
        /// The URL that failed.
        url: String,
        /// The error response, body included.
        response: NetworkResponse,
    },

    /// Response bytes could not be converted into the typed result.
    #[error("failed to parse response from {url}: {reason}")]
    Parse {
        /// The URL whose response failed to parse.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Local file system error while transferring a download.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The server's `Content-Range` disagrees with the resumption point.
    ///
    /// The temporary file is considered corrupt and must be removed by the caller.
    #[error(
        "content range mismatch for {url}: expected `{expected}`, server sent `{actual}`; remove {}",
        temp_path.display()
    )]
    InvalidContentRange {
        /// The download URL.
        url: String,
        /// The range the request expected to receive.
        expected: String,
        /// The `Content-Range` header the server sent.
        actual: String,
        /// The temporary file holding the partial transfer.
        temp_path: PathBuf,
    },

    /// The request was cancelled at a checkpoint.
    #[error("request to {url} was cancelled")]
    Cancelled {
        /// The cancelled URL.
        url: String,
    },

    /// Anything unanticipated, including panics caught inside request processing.
    #[error("unexpected error requesting {url}: {source}")]
    Other {
        /// The URL being processed.
        url: String,
        /// The wrapped error.
        #[source]
        source: BoxError,
    },
}

impl RequestError {
    /// Creates a network error.
    pub fn network(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Network {
            url: url.into(),
            source: source.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an authentication failure carrying the rejected response.
    pub fn auth_failure(url: impl Into<String>, response: NetworkResponse) -> Self {
        Self::AuthFailure {
            url: url.into(),
            response,
        }
    }

    /// Creates a server error carrying the error response.
    pub fn server(url: impl Into<String>, response: NetworkResponse) -> Self {
        Self::Server {
            url: url.into(),
            response,
        }
    }

    /// Creates a parse error.
    pub fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a cancellation marker.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Wraps an unanticipated error.
    pub fn other(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Other {
            url: url.into(),
            source: source.into(),
        }
    }

    /// Returns true for failures the retry policy may retry in place.
    ///
    /// Only timeouts and authentication failures qualify; everything else is
    /// delivered as final and left to the caller to resubmit.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::AuthFailure { .. })
    }

    /// Returns the HTTP status attached to the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthFailure { response, .. } | Self::Server { response, .. } => {
                Some(response.status)
            }
            _ => None,
        }
    }

    /// Returns a short label for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::AuthFailure { .. } => "auth",
            Self::Server { .. } => "server",
            Self::Parse { .. } => "parse",
            Self::Io { .. } => "io",
            Self::InvalidContentRange { .. } => "content_range",
            Self::Cancelled { .. } => "cancelled",
            Self::Other { .. } => "other",
        }
    }
}

/// Renders a caught panic payload for logs and [`RequestError::Other`].
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
