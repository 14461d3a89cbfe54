//! Pluggable HTTP transport for KMS requests.
//!
//! The request engine only needs `POST(url, body, headers) -> response`, so
//! that is the whole trait. Production uses [`ReqwestClient`]; tests inject
//! scripted in-memory clients.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::ConnectorError;

/// Ambient headers attached to every outgoing KMS request. Validation tokens
/// travel in the body, never in headers.
pub fn ambient_headers() -> Vec<(String, String)> {
    vec![
        ("Content-Type".into(), "application/json".into()),
        ("Accept".into(), "application/json".into()),
    ]
}

/// A raw HTTP response as seen by the request engine.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code; only 200 counts as success.
    pub status: u16,
    /// Response body, expected to be a JSON document.
    pub body: String,
}

/// Minimal HTTP client contract used by the request engine.
///
/// Implementations must be safe to share across concurrently running worker
/// tasks.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Issue a POST and return the status and body.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::TimedOut`] or
    /// [`ConnectorError::ConnectionFailed`] for connectivity failures, and
    /// [`ConnectorError::HttpRequestFailed`] for any other transport error.
    /// A non-200 status is *not* an error at this layer; the engine decides.
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, ConnectorError>;
}

/// Production [`RestClient`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Build a client with the given per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying TLS backend cannot be initialised.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build KMS HTTP client")?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl RestClient for ReqwestClient {
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, ConnectorError> {
        let mut req = self.inner.post(url).body(body.to_owned());
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(map_transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_transport_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn map_transport_error(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::TimedOut
    } else if e.is_connect() {
        ConnectorError::ConnectionFailed(e.to_string())
    } else {
        ConnectorError::HttpRequestFailed(e.to_string())
    }
}
