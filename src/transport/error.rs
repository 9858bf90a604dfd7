//! Stream error types

use thiserror::Error;

/// Status codes treated as temporary server trouble
pub const TRANSIENT_STATUS_CODES: [u16; 3] = [502, 503, 504];

/// Chat stream error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Network, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Transient, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Protocol, message)
    }

    /// Classify a non-success response
    pub fn from_status(status: u16, body: &str) -> Self {
        let err = if TRANSIENT_STATUS_CODES.contains(&status) {
            Self::transient(format!("Server temporarily unavailable ({status})"))
        } else if body.is_empty() {
            Self::protocol(format!("HTTP {status}"))
        } else {
            Self::protocol(format!("HTTP {status}: {body}"))
        };
        err.with_status(status)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Connect failures, timeouts, resets, broken reads - retryable
    Network,
    /// 502/503/504 - retryable
    Transient,
    /// Any other non-success status or a missing body - not retryable
    Protocol,
}

impl StreamErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Transient)
    }
}
