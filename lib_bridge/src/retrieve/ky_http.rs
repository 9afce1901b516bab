//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client around `reqwest` with retry middleware and JSON handling.
//! Transport failures are mapped onto [`BridgeError`] so callers can tell a timeout from a
//! refused connection from a malformed body.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;
use url::Url;

use crate::errors::{BridgeError, Result};

/// Header Kismet reads the API key from.
const API_KEY_HEADER: &str = "KISMET";

/// A deserialized response plus the transaction metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body on 2xx.
    pub data: Option<T>,
    /// The raw body on non-2xx.
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// The body of a successful response, or a connection error carrying the status.
    pub fn into_data(self) -> Result<T> {
        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(BridgeError::Connection(format!(
                "HTTP {}: {}",
                self.status,
                self.error_body.unwrap_or_default().chars().take(200).collect::<String>()
            ))),
        }
    }
}

/// # Api Client
///
/// Joins relative paths onto a base URL, injects the API key, applies a timeout per attempt
/// and retries transient failures with exponential backoff.
#[derive(Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    api_key: Option<HeaderValue>,
    timeout: Duration,
}

impl ApiClient {
    /// # Arguments
    /// * `base_url` - Absolute base URL, e.g. `http://localhost:2501`.
    /// * `api_key` - Sent as the `KISMET` header when present.
    /// * `timeout` - Per-attempt request timeout.
    /// * `max_retries` - Transient-error retries inside one request.
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| BridgeError::Config(format!("invalid base URL '{}': {}", base_url, e)))?;
        // `Url::join` replaces the last segment unless the base ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let api_key = api_key
            .filter(|k| !k.is_empty())
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|e| {
                BridgeError::Config(format!("API key is not a valid header value: {}", e))
            })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("kismet-tak-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {}", e)))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url, api_key, timeout })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// # Request
    ///
    /// Performs one HTTP exchange. Non-2xx answers are returned as an unsuccessful
    /// [`ApiResponse`], not as an error.
    ///
    /// # Errors
    /// `Timeout` when the server did not answer in time, `Connection` when it could not be
    /// reached, `Protocol` when a 2xx body does not decode, `Config` for a bad path.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| BridgeError::Config(format!("invalid path '{}': {}", path, e)))?;
        trace!(%method, %url, "HTTP request");

        let mut req = self.inner.request(method, url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key.clone());
        }
        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(serde_json::to_string(b)?);
        }

        let response = req.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await.map_err(|e| {
                BridgeError::Protocol(format!("undecodable response from {}: {}", path, e))
            })?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            let error_body = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body,
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }

    /// GET returning the decoded body of a 2xx answer.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<T, ()>(Method::GET, path, None).await?.into_data()
    }

    /// POST with a JSON body returning the decoded body of a 2xx answer.
    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request::<T, B>(Method::POST, path, Some(body)).await?.into_data()
    }

    fn map_error(&self, error: reqwest_middleware::Error) -> BridgeError {
        match error {
            reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => {
                BridgeError::Timeout(self.timeout)
            }
            reqwest_middleware::Error::Reqwest(e) => BridgeError::Connection(e.to_string()),
            reqwest_middleware::Error::Middleware(e) => BridgeError::Connection(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let base = "http://kismet.local:2501/api";
        let client = ApiClient::new(base, None, Duration::from_secs(1), 0).unwrap();
        assert_eq!(client.base_url().as_str(), "http://kismet.local:2501/api/");
        assert_eq!(
            client.base_url().join("system/status.json").unwrap().as_str(),
            "http://kismet.local:2501/api/system/status.json"
        );
    }

    #[test]
    fn test_invalid_inputs_are_config_errors() {
        assert!(matches!(
            ApiClient::new("not a url", None, Duration::from_secs(1), 0),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            ApiClient::new("http://localhost:2501", Some("bad\nkey"), Duration::from_secs(1), 0),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_unsuccessful_response_into_data() {
        let response: ApiResponse<serde_json::Value> = ApiResponse {
            data: None,
            error_body: Some("unauthorized".into()),
            status: 401,
            success: false,
            headers: HeaderMap::new(),
        };
        match response.into_data() {
            Err(BridgeError::Connection(msg)) => assert!(msg.contains("401")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        // Port 9 (discard) on loopback is closed on test hosts.
        let client =
            ApiClient::new("http://127.0.0.1:9", None, Duration::from_secs(2), 0).unwrap();
        let result = client.get_json::<serde_json::Value>("system/status.json").await;
        assert!(matches!(result, Err(BridgeError::Connection(_)) | Err(BridgeError::Timeout(_))));
    }
}
