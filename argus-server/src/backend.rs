//! Outbound HTTP client for the inference backend

use crate::error::ProxyError;
use crate::shutdown::Shutdown;
use argus_common::config::BackendConfig;
use bytes::Bytes;
use http::request::Parts;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Pooled client bound to one backend base URL
pub struct Backend {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
    health_timeout: Duration,
    health_path: String,
}

impl Backend {
    pub fn new(config: &BackendConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout),
            health_timeout: Duration::from_secs(config.health_timeout),
            health_path: config.health_path.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send the inbound request to the backend with its original body bytes.
    ///
    /// Every header except `Host` is copied; the client sets `Host` from the
    /// backend URL. The configured timeout covers the wait for the response
    /// head, and shutdown aborts the wait.
    pub async fn forward(
        &self,
        parts: &Parts,
        body: Bytes,
        shutdown: &mut Shutdown,
    ) -> Result<Response<Incoming>, ProxyError> {
        let path = parts.uri.path();
        let query = parts
            .uri
            .query()
            .map(|q| format!("?{}", q))
            .unwrap_or_default();
        let upstream_url = format!("{}{}{}", self.base_url, path, query);
        debug!("Proxying {} to {}", parts.method, upstream_url);

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(&upstream_url);

        for (name, value) in &parts.headers {
            if name != hyper::header::HOST {
                builder = builder.header(name, value);
            }
        }

        let upstream_req = builder.body(Full::new(body))?;
        self.send(upstream_req, self.timeout, shutdown).await
    }

    /// Read a whole response body under the request timeout
    pub async fn read_body(
        &self,
        body: Incoming,
        shutdown: &mut Shutdown,
    ) -> Result<Bytes, ProxyError> {
        tokio::select! {
            result = tokio::time::timeout(self.timeout, body.collect()) => match result {
                Ok(Ok(collected)) => Ok(collected.to_bytes()),
                Ok(Err(e)) => Err(ProxyError::ReadResponse(e)),
                Err(_) => Err(ProxyError::Timeout(self.timeout)),
            },
            _ = shutdown.wait() => Err(ProxyError::ShuttingDown),
        }
    }

    /// Probe the backend health path with the short health timeout
    pub async fn probe(&self, shutdown: &mut Shutdown) -> Result<(), HealthError> {
        self.probe_with_timeout(self.health_timeout, shutdown).await
    }

    /// Startup check; uses the full request timeout
    pub async fn verify_connection(&self, shutdown: &mut Shutdown) -> Result<(), HealthError> {
        self.probe_with_timeout(self.timeout, shutdown).await
    }

    async fn probe_with_timeout(
        &self,
        timeout: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<(), HealthError> {
        let url = format!("{}{}", self.base_url, self.health_path);
        let req = Request::get(&url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| HealthError::Request(e.to_string()))?;

        let response = self
            .send(req, timeout, shutdown)
            .await
            .map_err(|e| HealthError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(HealthError::Status(status.as_u16())),
        }
    }

    async fn send(
        &self,
        req: Request<Full<Bytes>>,
        timeout: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<Response<Incoming>, ProxyError> {
        tokio::select! {
            result = tokio::time::timeout(timeout, self.client.request(req)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(ProxyError::Backend(e)),
                Err(_) => Err(ProxyError::Timeout(timeout)),
            },
            _ = shutdown.wait() => Err(ProxyError::ShuttingDown),
        }
    }
}

/// Why a health probe failed
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("{0}")]
    Request(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend returned status {0}")]
    Status(u16),
}
