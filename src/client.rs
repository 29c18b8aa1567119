//! Shared HTTP client for self-directed sub-requests.
//!
//! One `reqwest::Client` (and its connection pool) is shared by every clone,
//! so a fan-out of many concurrent requests reuses connections to the local
//! listener instead of opening a client per request.

use std::net::SocketAddr;

/// Errors returned by [`DelayClient`].
#[derive(Debug)]
pub enum ClientError {
    /// The underlying client could not be constructed.
    Build { source: reqwest::Error },
    /// The request could not be sent or no response arrived.
    Request { url: String, source: reqwest::Error },
    /// The server answered with a non-success status.
    Status { url: String, source: reqwest::Error },
    /// The response body could not be read.
    Body { url: String, source: reqwest::Error },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Build { source } => write!(f, "failed to build http client: {}", source),
            ClientError::Request { url, source } => {
                write!(f, "request to {} failed: {}", url, source)
            }
            ClientError::Status { url, source } => {
                write!(f, "request to {} returned an error status: {}", url, source)
            }
            ClientError::Body { url, source } => {
                write!(f, "failed to read response body from {}: {}", url, source)
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Build { source } => Some(source),
            ClientError::Request { source, .. } => Some(source),
            ClientError::Status { source, .. } => Some(source),
            ClientError::Body { source, .. } => Some(source),
        }
    }
}

/// Client for the `/test/delay/{id}` endpoint of this process.
#[derive(Debug, Clone)]
pub struct DelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl DelayClient {
    /// Client targeting the given listening address.
    ///
    /// An unspecified bind address (`0.0.0.0` / `::`) is reached via loopback.
    pub fn for_listener(local_addr: SocketAddr) -> Result<Self, ClientError> {
        let mut target = local_addr;
        if target.ip().is_unspecified() {
            target.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        Self::new(format!("http://{target}"))
    }

    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Build { source: e })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `/test/delay/{id}` and return the response body.
    pub async fn delay(&self, id: u32) -> Result<String, ClientError> {
        let url = format!("{}/test/delay/{}", self.base_url, id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Request {
                url: url.clone(),
                source: e,
            })?;
        let resp = resp.error_for_status().map_err(|e| ClientError::Status {
            url: url.clone(),
            source: e,
        })?;
        resp.text()
            .await
            .map_err(|e| ClientError::Body { url, source: e })
    }
}
