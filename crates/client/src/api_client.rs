//! HTTP API client with bearer-token support.

use std::time::Duration;

use deskline_shared::ApiError;
use reqwest::Client;
use serde::Serialize;

/// Minimal HTTP client for the REST side; only what the real-time core needs.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    timeout: Option<Duration>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: None,
        }
    }

    /// Bound every request; an elapsed timeout surfaces as `ApiError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// POST a JSON body to an absolute URL and return the raw response text
    /// on 2xx.
    pub async fn post_json_text<TReq: Serialize>(
        &self,
        url: &str,
        body: &TReq,
        bearer: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut rb = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(body);

        if let Some(token) = bearer {
            rb = rb.bearer_auth(token);
        }
        if let Some(timeout) = self.timeout {
            rb = rb.timeout(timeout);
        }

        let resp = rb.send().await.map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp.text().await.map_err(map_reqwest_error)?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        Ok(text)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(err.to_string())
    }
}
