//! Error types for configuration and delivery

use std::time::Duration;
use thiserror::Error;

/// Result of a single backend operation
pub type DeliveryResult = std::result::Result<(), DeliveryError>;

/// Raised at construction time when the configuration cannot be used.
///
/// These are integration mistakes, so they are the only errors the crate
/// hands back to the host application.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TelemetryConfig: {field} is required and cannot be empty")]
    MissingField { field: &'static str },

    #[error("TelemetryConfig: {field} must be a valid http(s) URL (got: {value})")]
    InvalidUrl { field: &'static str, value: String },

    #[error("TelemetryConfig: timeout must be between 1 and 60 seconds (got: {0})")]
    InvalidTimeout(u64),

    #[error("TelemetryConfig: batch_size must be greater than 0")]
    InvalidBatchSize,

    #[error("TelemetryConfig: {field} must be a finite, non-negative number of seconds (got: {value})")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error("TelemetryConfig: {field} must contain only letters, digits and underscores (got: {value})")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("TelemetryConfig: unknown backend '{0}' (expected otlp, clickhouse or debug)")]
    UnknownBackend(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Why a payload did not reach its destination.
///
/// Backends return these; the client logs them at debug level and moves on.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("rejected by server: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid {signal}: {reason}")]
    Validation { signal: &'static str, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("failed to write payload: {0}")]
    Output(#[source] std::io::Error),
}

impl DeliveryError {
    /// Network failures, timeouts and 5xx answers are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Network(_)
                | DeliveryError::Timeout(_)
                | DeliveryError::ServerError { .. }
        )
    }

    pub(crate) fn validation(signal: &'static str, reason: impl Into<String>) -> Self {
        DeliveryError::Validation {
            signal,
            reason: reason.into(),
        }
    }
}
