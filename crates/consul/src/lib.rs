//! Consul KV client for Rust
//!
//! A small async interface to the `/v1/kv` endpoints of a Consul agent.
//! Values are raw bytes; reads use `?raw` so no base64 decoding is needed.
//!
//! # Example
//!
//! ```no_run
//! use consul::Client;
//!
//! # async fn demo() -> consul::Result<()> {
//! let kv = Client::new("http://127.0.0.1:8500").with_token("secret");
//!
//! kv.put("app/config/db_host", b"10.0.0.5").await?;
//! let value = kv.get("app/config/db_host").await?;
//! assert_eq!(value.as_deref(), Some(&b"10.0.0.5"[..]));
//!
//! kv.delete("app/config/db_host").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Header carrying the ACL token on every request.
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Errors that can occur when talking to Consul
#[derive(Error, Debug)]
pub enum Error {
    #[error("request to Consul failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consul returned {status} for key {key}: {body}")]
    Status { status: u16, key: String, body: String },

    #[error("Consul rejected write to key {0}")]
    Rejected(String),

    #[error("invalid Consul endpoint: {0}")]
    InvalidEndpoint(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    ///
    /// Connection failures, timeouts, 429 and 5xx answers are transient;
    /// everything else (bad token, malformed key) will fail again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            Error::Rejected(_) | Error::InvalidEndpoint(_) => false,
        }
    }
}

/// Result type for Consul operations
pub type Result<T> = std::result::Result<T, Error>;

/// Async Consul KV client
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    /// Create a client for the agent at `endpoint` (e.g. `http://127.0.0.1:8500`)
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            ..Self::new(endpoint)
        })
    }

    /// Attach an ACL token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    /// The agent endpoint this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the KV URL for a key, percent-encoding every path segment
    pub fn key_url(&self, key: &str) -> Result<String> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(Error::InvalidEndpoint(self.endpoint.clone()));
        }

        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();

        Ok(format!("{}/v1/kv/{}", self.endpoint, encoded.join("/")))
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match self.token {
            Some(ref token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Read a key. Returns `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}?raw", self.key_url(key)?);
        tracing::trace!(key, "GET");

        let response = self.request(reqwest::Method::GET, url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                key: key.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// Create or replace a key
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let url = self.key_url(key)?;
        tracing::trace!(key, bytes = value.len(), "PUT");

        let response = self
            .request(reqwest::Method::PUT, url)
            .body(value.to_vec())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                key: key.to_string(),
                body,
            });
        }

        // Consul answers `true`/`false`; `false` only happens on failed CAS or lock
        if body.trim() == "false" {
            return Err(Error::Rejected(key.to_string()));
        }

        Ok(())
    }

    /// Delete a key. Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let url = self.key_url(key)?;
        tracing::trace!(key, "DELETE");

        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                key: key.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_url_encodes_segments() {
        let client = Client::new("http://127.0.0.1:8500/");
        let url = client.key_url("repo/main/dir with space/a+b.txt").unwrap();
        assert_eq!(
            url,
            "http://127.0.0.1:8500/v1/kv/repo/main/dir%20with%20space/a%2Bb.txt"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        let client = Client::new("127.0.0.1:8500");
        assert!(matches!(
            client.key_url("a"),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let client = Client::new("http://localhost:8500").with_token("");
        assert!(client.token.is_none());

        let client = client.with_token("abc");
        assert_eq!(client.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_status_errors_transience() {
        let err = Error::Status {
            status: 503,
            key: "k".into(),
            body: String::new(),
        };
        assert!(err.is_transient());

        let err = Error::Status {
            status: 403,
            key: "k".into(),
            body: "ACL not found".into(),
        };
        assert!(!err.is_transient());
        assert!(!Error::Rejected("k".into()).is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_transient() {
        // Port 9 (discard) is closed on test machines
        let client = Client::with_timeout("http://127.0.0.1:9", Duration::from_millis(500))
            .unwrap();
        let err = client.get("anything").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
