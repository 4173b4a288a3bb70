//! HTTP error types

use conduit_resilience::Retryable;
use reqwest::StatusCode;
use std::time::Duration;

/// Error type for HTTP operations
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("Rate limited on '{route}' (global: {global}), retry after {retry_after:?}")]
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Network(error) => error.status(),
            HttpError::Status { status, .. } => Some(*status),
            HttpError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            HttpError::InvalidRequest(_) => None,
        }
    }
}

/// Whether a response status is worth retrying
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

impl Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        match self {
            // Builder errors will fail identically on every attempt
            HttpError::Network(error) => !error.is_builder(),
            HttpError::Status { status, .. } => is_retryable_status(*status),
            HttpError::RateLimited { .. } => true,
            HttpError::InvalidRequest(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            HttpError::Status { retry_after, .. } => *retry_after,
            HttpError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
