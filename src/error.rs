//! Error types shared by the cache and the outbound gateway.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the upstream API or the transport underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// HTTP status, `None` for transport-level failures (connect, timeout).
    pub status: Option<u16>,
    pub message: String,
    /// Parsed `Retry-After` hint, if the upstream sent one.
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// 429, 5xx and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(429) => true,
            Some(s) => (500..600).contains(&s),
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(s) => write!(f, "upstream returned HTTP {}: {}", s, self.message),
            None => write!(f, "upstream request failed: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest only attaches a status on error_for_status(), which we don't use
        Self {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
            retry_after: None,
        }
    }
}

/// Error type for everything routed through the cache and gateway.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The gateway queue is at `max_queue_size`.
    #[error("request queue is full ({capacity} pending)")]
    Capacity { capacity: usize },

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },

    /// The spawned fetch task panicked or was aborted.
    #[error("fetch task failed: {0}")]
    TaskFailed(String),

    #[error("failed to decode upstream body: {0}")]
    Decode(String),

    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    /// Final HTTP status, looking through `RetriesExhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Upstream(e) => e.status,
            GatewayError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Upstream(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::Upstream(e) => e.retry_after,
            GatewayError::RetriesExhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled(_))
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(e: tokio::task::JoinError) -> Self {
        GatewayError::TaskFailed(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
