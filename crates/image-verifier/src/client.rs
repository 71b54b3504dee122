//! Shared HTTP client used by every verification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Settings for the shared client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied to each request
    pub request_timeout: Duration,
    /// User agent sent with each request
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("image-verifier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A response reduced to what the checks look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Body decoded as text
    pub body: String,
}

/// HTTP client created once per run and stopped once at the end
pub struct SharedHttpClient {
    client: reqwest::Client,
    requests: AtomicUsize,
}

impl SharedHttpClient {
    /// Build the client
    pub fn start(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(Error::ClientStartup)?;

        info!("HTTP client started (request timeout {:?})", config.request_timeout);
        Ok(Self {
            client,
            requests: AtomicUsize::new(0),
        })
    }

    /// Issue one GET and read the whole body
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let request_error = |source| Error::Request {
            url: url.to_string(),
            source,
        };

        debug!("GET {}", url);
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(request_error)?;
        debug!("GET {} -> {} ({} bytes)", url, status, body.len());

        Ok(HttpResponse { status, body })
    }

    /// Whether anything at `url` answers with an HTTP response
    pub async fn responds(&self, url: &str) -> bool {
        self.client.get(url).send().await.is_ok()
    }

    /// Number of GET requests issued so far
    pub fn requests_sent(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Stop the client. Consumes it, so it can only happen once.
    pub fn stop(self) {
        info!("HTTP client stopped after {} requests", self.requests_sent());
    }
}
