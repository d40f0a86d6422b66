//! Error types for client operations.

use tether_core::BackoffError;
use tether_transport::TransportError;
use thiserror::Error;

/// Error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Backoff policy refused to produce another delay.
    #[error("backoff error: {0}")]
    Backoff(#[from] BackoffError),

    /// No tokio runtime is available to drive timers.
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong with it.
        message: String,
    },

    /// The session has been dropped.
    #[error("session closed")]
    SessionClosed,
}

impl ClientError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
