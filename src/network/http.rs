//! reqwest-backed transport.
//!
//! One [`ReqwestNetwork`] is created per engine and shared by every network
//! worker, so connections are pooled across requests.

use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use tracing::{debug, instrument};

use super::{HttpRequest, Network, RawResponse};
use crate::error::RequestError;
use crate::user_agent;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Production [`Network`] over a pooled `reqwest::Client`.
///
/// The attempt timeout carried by each [`HttpRequest`] bounds the wait for
/// response headers and, separately, the wait for every body chunk. A large
/// download therefore only times out when the server stalls.
///
/// # Example
///
/// ```no_run
/// use fetchq_core::network::ReqwestNetwork;
///
/// # fn example() -> Result<(), reqwest::Error> {
/// let network = ReqwestNetwork::new(30, None)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ReqwestNetwork {
    client: Client,
}

impl ReqwestNetwork {
    /// Creates a transport with the given connect timeout and User-Agent.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend or system proxy
    /// configuration cannot be loaded.
    pub fn new(
        connect_timeout_secs: u64,
        user_agent: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let user_agent = user_agent.map_or_else(user_agent::default_user_agent, str::to_string);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .gzip(true)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Returns the underlying client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait::async_trait]
impl Network for ReqwestNetwork {
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn perform(&self, request: &HttpRequest) -> Result<RawResponse, RequestError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match tokio::time::timeout(request.timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(map_reqwest_error(&request.url, error)),
            Err(_) => return Err(RequestError::timeout(&request.url)),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        debug!(status, "response headers received");

        let chunks = Box::pin(response.bytes_stream());
        let url = request.url.clone();
        let timeout = request.timeout;
        let body = stream::unfold(
            (chunks, url, timeout),
            |(mut chunks, url, timeout)| async move {
                let item = match tokio::time::timeout(timeout, chunks.next()).await {
                    Ok(None) => return None,
                    Ok(Some(Ok(chunk))) => Ok(chunk),
                    Ok(Some(Err(error))) => Err(map_reqwest_error(&url, error)),
                    Err(_) => Err(RequestError::timeout(&url)),
                };
                Some((item, (chunks, url, timeout)))
            },
        )
        .boxed();

        Ok(RawResponse::new(status, headers, body))
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> RequestError {
    if error.is_timeout() {
        RequestError::timeout(url)
    } else {
        RequestError::network(url, error)
    }
}
