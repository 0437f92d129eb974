//! Top-level error type shared across components
//!
//! # Design Principles (KISS)
//! - Provide common error variants used across multiple components
//! - Each component can wrap these or define additional variants
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

/// Top-level middleware error, composed from each component's own error type
/// via `#[from]`. Binaries see this through `anyhow::Result` at the edge;
/// everything below `main()` returns a typed `MiddlewareResult<T>`.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    /// MQTT client error (ingress or command service)
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Database error (storage writer)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send failed (receiver dropped)
    #[error("Channel send failed: receiver dropped")]
    ChannelSend,

    /// Channel receive failed (sender dropped)
    #[error("Channel receive failed: sender dropped")]
    ChannelRecv,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout waiting for operation
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl MiddlewareError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Result type alias using MiddlewareError
pub type MiddlewareResult<T> = Result<T, MiddlewareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error() {
        let err = MiddlewareError::config("missing required field");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("missing required field"));
    }

    #[test]
    fn test_timeout_error() {
        let err = MiddlewareError::timeout("waiting for response");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_channel_send_error() {
        let err = MiddlewareError::ChannelSend;
        assert!(err.to_string().contains("Channel send failed"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MiddlewareError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_other_error() {
        let err = MiddlewareError::other("something went wrong");
        assert!(err.to_string().contains("something went wrong"));
    }
}
