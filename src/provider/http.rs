//! Retrying client for catalogue, token and metadata endpoints
//!
//! Retries on:
//! - Network errors (timeout, connection refused)
//! - 5xx server errors
//! - 429 rate limit errors
//!
//! Does not retry on 4xx client errors; the response body is kept in the
//! error so provider diagnostics reach the caller.

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{FetchError, FetchResult, Provider};
use crate::metrics::record_api_request;
use crate::shared_resources::global_api_client;
use crate::transfer::retry::{classify, format_retry};
use crate::transfer::{TransferConfig, TransferError};

/// Longest response body kept in error messages
const MAX_ERROR_BODY: usize = 1024;

/// HTTP client shared by the requests of one adapter
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Arc<Client>,
    provider: Provider,
    policy: TransferConfig,
}

impl ApiClient {
    /// Client on the global connection pool; `policy` bounds retries and backoff
    pub fn new(provider: Provider, policy: TransferConfig) -> Self {
        Self {
            client: global_api_client(),
            provider,
            policy,
        }
    }

    /// Use a specific HTTP client
    pub fn with_client(mut self, client: Arc<Client>) -> Self {
        self.client = client;
        self
    }

    /// Retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Send the request built by `build`, retrying transient failures.
    ///
    /// `build` is called once per attempt; `endpoint` names the call in logs
    /// and metrics.
    pub async fn send<F>(&self, endpoint: &str, build: F) -> FetchResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let max_retries = self.policy.max_retries;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            let request = build(&self.client)
                .build()
                .map_err(|e| TransferError::from_reqwest(endpoint, e))?;
            let url = request.url().to_string();
            debug!(provider = %self.provider, endpoint, url = %url, attempt, "Sending request");

            let (class, error) = match self.client.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    record_api_request(self.provider.table_name(), endpoint, Some(status.as_u16()));

                    if status.is_success() {
                        debug!(endpoint, attempt = attempt + 1, "Request succeeded");
                        return Ok(response);
                    }

                    let class = classify(Some(status), None);
                    let body = response.text().await.unwrap_or_default();
                    let error = FetchError::Http {
                        status: status.as_u16(),
                        url,
                        message: truncate(body.trim()),
                    };
                    if !class.is_retryable() {
                        return Err(error);
                    }
                    (class, error)
                }
                Err(e) => {
                    record_api_request(self.provider.table_name(), endpoint, None);
                    let class = classify(None, Some(&e));
                    (class, FetchError::Network { url, message: e.to_string() })
                }
            };

            if attempt < max_retries {
                let backoff = self.policy.backoff(attempt);
                warn!(
                    "{}",
                    format_retry(attempt + 1, max_retries, class, backoff, endpoint)
                );
                tokio::time::sleep(backoff).await;
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| FetchError::Network {
            url: endpoint.to_string(),
            message: "All retries exhausted".to_string(),
        }))
    }

    /// Send and deserialize a JSON body
    pub async fn json<T, F>(&self, endpoint: &str, build: F) -> FetchResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.send(endpoint, build).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Parse(format!("{endpoint}: failed to deserialize response: {e}")))
    }

    /// Send and read the body as text
    pub async fn text<F>(&self, endpoint: &str, build: F) -> FetchResult<String>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.send(endpoint, build).await?;
        response.text().await.map_err(|e| FetchError::Network {
            url: endpoint.to_string(),
            message: e.to_string(),
        })
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
