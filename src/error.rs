use crate::{retry_after_secs, FailureKind};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::error;

#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error("No crawl slot became available within {0:?}")]
    AdmissionTimeout(Duration),

    #[error("Worker initialization failed: {0}")]
    WorkerInit(String),

    #[error("Crawl failed: {0}")]
    Execution(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration, limit: usize },

    #[error("{0}")]
    Authentication(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CrawlError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::AdmissionTimeout(_)
                | CrawlError::WorkerInit(_)
                | CrawlError::Timeout(_)
                | CrawlError::WorkerCrashed(_)
                | CrawlError::RateLimitExceeded { .. }
                | CrawlError::ShuttingDown
        )
    }

    /// Whether the worker that produced this error must be disposed rather
    /// than returned to the pool.
    pub fn breaks_worker(&self) -> bool {
        matches!(self, CrawlError::Timeout(_) | CrawlError::WorkerCrashed(_))
    }

    /// Classification used when the error becomes a per-job failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CrawlError::Timeout(_) => FailureKind::Timeout,
            CrawlError::AdmissionTimeout(_) => FailureKind::AdmissionTimeout,
            CrawlError::WorkerInit(_) => FailureKind::WorkerInit,
            CrawlError::Execution(_) | CrawlError::WorkerCrashed(_) | CrawlError::InvalidUrl(_) => {
                FailureKind::Execution
            }
            _ => FailureKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CrawlError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            CrawlError::Authentication(_) => StatusCode::UNAUTHORIZED,
            CrawlError::InvalidUrl(_) | CrawlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CrawlError::ShuttingDown | CrawlError::AdmissionTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CrawlError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            CrawlError::RateLimitExceeded { retry_after, .. } => {
                let secs = retry_after_secs(*retry_after);
                let mut response = (
                    status,
                    Json(json!({ "error": "Rate limit exceeded", "retry_after": secs })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                // Detail stays in the log.
                error!("Unhandled error: {}", self);
                (status, Json(json!({ "error": "Internal server error" }))).into_response()
            }
            _ => (status, Json(json!({ "error": self.to_string() }))).into_response(),
        }
    }
}

impl From<AcquireError> for CrawlError {
    fn from(_: AcquireError) -> Self {
        CrawlError::ShuttingDown
    }
}

impl From<std::io::Error> for CrawlError {
    fn from(err: std::io::Error) -> Self {
        CrawlError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let limited = CrawlError::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
            limit: 3,
        };
        assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            CrawlError::Authentication("Invalid API key".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            CrawlError::InvalidUrl("nope".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CrawlError::Internal("db exploded".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limit_response_carries_retry_after() {
        let response = CrawlError::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
            limit: 3,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_broken_worker_classification() {
        assert!(CrawlError::Timeout(Duration::from_secs(1)).breaks_worker());
        assert!(CrawlError::WorkerCrashed("ws closed".to_string()).breaks_worker());
        assert!(!CrawlError::Execution("404".to_string()).breaks_worker());
        assert!(!CrawlError::WorkerInit("spawn".to_string()).breaks_worker());
    }
}
