//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with middleware-based
//! exponential backoff retries and standardized JSON response handling. The
//! bridge transport, the bot-API sink and the chat-completion summarizer all
//! talk HTTP through it.

use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use url::Url;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with the status code and headers of the
/// HTTP transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// The error body, or an empty string.
    pub fn error_text(&self) -> &str {
        self.error_body.as_deref().unwrap_or_default()
    }
}

/// A flexible asynchronous HTTP client.
///
/// Handles the base URL, an optional bearer token and transient-failure
/// retries.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client retrying transient failures up to `max_retries` times.
    ///
    /// `base_url` must be absolute. A trailing `/` is added when missing so
    /// relative paths are joined below it rather than replacing its last
    /// segment.
    pub fn new(base_url: &str, auth_token: Option<String>, max_retries: u32) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, auth_token, max_retries, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = Url::parse(&base).map_err(|e| anyhow::anyhow!("Invalid base URL '{}': {}", base_url, e))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chanrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// `path` is relative to the base URL; `query` pairs are URL-encoded.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, network execution or
    /// deserialization of a successful body fails. Non-2xx answers are not
    /// errors; they come back with `success == false` and the raw body.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        // 1. Construct the full absolute URL
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method, full_url);
        if !query.is_empty() {
            req = req.query(query);
        }

        // 2. Add custom headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. Inject bearer authentication if a token is present
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        // 4. Serialize and attach the JSON body if present
        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 5. Execute the request and capture response metadata
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        // 6. Handle the result based on success status
        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<ApiResponse<T>> {
        self.request::<T, ()>(Method::GET, path, query, None, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, &[], None, Some(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = ApiClient::new("https://api.example.org/v1", None, 1).unwrap();
        assert_eq!(client.base_url().as_str(), "https://api.example.org/v1/");
        assert_eq!(
            client.base_url().join("chat/completions").unwrap().as_str(),
            "https://api.example.org/v1/chat/completions"
        );
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(ApiClient::new("not a url", None, 1).is_err());
    }
}
