//! HTTP transport seam.
//!
//! Gateways talk to their backend only through [`Transport`], so the
//! reconciliation logic can be driven by an in-memory fake in tests. The
//! default [`HttpTransport`] uses `reqwest` and maps failures onto the crate's
//! error taxonomy: connection problems, 429 and 5xx are retryable
//! [`Error::Connection`]; any other non-success status is a non-retryable
//! [`Error::Application`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use crate::error::{Error, Result};

/// One JSON request against a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute URL
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Full `Authorization` header value (e.g. `Token abc`, `Bearer xyz`)
    pub authorization: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
            authorization: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn authorization(mut self, value: Option<String>) -> Self {
        self.authorization = value;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and decode the JSON response body.
    async fn request(&self, request: ApiRequest) -> Result<Value>;

    /// `PUT` raw bytes to a (usually pre-signed) URL.
    async fn upload(&self, url: &str, content: Vec<u8>) -> Result<()>;
}

/// Join a base URL and an endpoint path with exactly one `/`.
pub fn join_url(base: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("hitl-sdk/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| Error::Connection(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn classify_send_error(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Connection(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            Error::Connection(format!("Connection failed: {}", e))
        } else if e.is_builder() {
            Error::application(None, format!("Invalid request: {}", e))
        } else {
            Error::Connection(format!("Request failed: {}", e))
        }
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::Connection(format!("HTTP {}: {}", status.as_u16(), body))
    } else {
        Error::application(Some(status.as_u16()), body.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            params = ?request.query,
            "HITL request"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        if let Some(auth) = &request.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(Self::classify_send_error)?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Connection(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            tracing::debug!(status = status.as_u16(), body = %body, "HITL request rejected");
            return Err(status_error(status, &body));
        }

        // Some backends label JSON as application/octet-stream; ignore the header.
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn upload(&self, url: &str, content: Vec<u8>) -> Result<()> {
        tracing::debug!(url = %url, bytes = content.len(), "Uploading image");

        let response = self
            .client
            .put(url)
            .body(content)
            .send()
            .await
            .map_err(Self::classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(())
    }
}
