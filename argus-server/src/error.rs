//! Per-request failures and their client-facing responses

use crate::proxy::{text_response, ProxyBody};
use hyper::{Response, StatusCode};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to read request body: {0}")]
    ReadRequest(#[source] hyper::Error),

    #[error("invalid request format: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("failed to build backend request: {0}")]
    BuildRequest(#[from] http::Error),

    #[error("backend request failed: {0}")]
    Backend(#[from] hyper_util::client::legacy::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("failed to read backend response: {0}")]
    ReadResponse(#[source] hyper::Error),

    #[error("proxy is shutting down")]
    ShuttingDown,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ReadRequest(_) | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BuildRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Backend(_) | ProxyError::ReadResponse(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the failure is the backend's and should count against the model
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Backend(_) | ProxyError::Timeout(_) | ProxyError::ReadResponse(_)
        )
    }

    /// Short client-facing message; details stay in the logs
    fn public_message(&self) -> &'static str {
        match self {
            ProxyError::ReadRequest(_) => "Failed to read request",
            ProxyError::InvalidRequest(_) => "Invalid request format",
            ProxyError::BuildRequest(_) => "Failed to create proxy request",
            ProxyError::Backend(_) => "Proxy request failed",
            ProxyError::Timeout(_) => "Backend request timed out",
            ProxyError::ReadResponse(_) => "Failed to read backend response",
            ProxyError::ShuttingDown => "Proxy is shutting down",
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        text_response(self.status(), self.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let invalid = ProxyError::InvalidRequest(serde_json::from_str::<u8>("x").unwrap_err());
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert!(!invalid.is_backend_failure());

        let timeout = ProxyError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(timeout.is_backend_failure());

        assert_eq!(ProxyError::ShuttingDown.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!ProxyError::ShuttingDown.is_backend_failure());
    }

    #[test]
    fn test_response_carries_plain_text_message() {
        let response = ProxyError::Timeout(Duration::from_secs(1)).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
