//! JSON responses.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{NetworkResponse, Priority, RequestStrategy, Response};
use crate::error::RequestError;

/// Deserializes the body into `T` with `serde_json`.
pub struct JsonStrategy<T> {
    priority: Priority,
    _output: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for JsonStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonStrategy")
            .field("priority", &self.priority)
            .finish()
    }
}

impl<T> Default for JsonStrategy<T> {
    fn default() -> Self {
        Self::with_priority(Priority::Normal)
    }
}

impl<T> JsonStrategy<T> {
    /// Creates a strategy with normal priority.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a strategy with the given default priority.
    #[must_use]
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<T> RequestStrategy for JsonStrategy<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn priority(&self) -> Priority {
        self.priority
    }

    async fn parse(
        &self,
        url: &str,
        response: &NetworkResponse,
    ) -> Result<Response<T>, RequestError> {
        let value = serde_json::from_slice(&response.data)
            .map_err(|e| RequestError::parse(url, format!("invalid JSON: {e}")))?;
        Ok(Response::success(value, response))
    }
}
