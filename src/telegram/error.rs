//! Transport error types

use std::time::Duration;
use thiserror::Error;

/// Transport error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::RateLimit, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Forbidden, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unknown, message)
    }
}

/// Error classification for delivery reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection failures - retryable
    Network,
    /// Flood control (429) - retryable after `retry_after`
    RateLimit,
    /// Platform 5xx - retryable
    ServerError,
    /// Bad or revoked token (401) - not retryable
    Unauthorized,
    /// Recipient blocked the bot or left (403) - not retryable
    Forbidden,
    /// Bad request, e.g. chat not found or stale file id (400)
    InvalidRequest,
    /// No answer within the per-send deadline
    Timeout,
    Unknown,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::ServerError | Self::Timeout
        )
    }

    /// Map an HTTP status (or the API's `error_code`) to a kind
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            400 | 404 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}
