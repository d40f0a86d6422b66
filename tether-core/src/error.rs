//! Error types for tether core operations.

use thiserror::Error;

/// Error returned by a backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// The limited backoff has handed out all of its attempts.
    #[error("retry limit exceeded: {limit} attempts allowed")]
    RetryLimitExceeded {
        /// Number of attempts the policy allows over its lifetime.
        limit: u32,
    },
}

/// Core error type for tether operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Backoff policy refused to produce another delay.
    #[error("backoff error: {0}")]
    Backoff(#[from] BackoffError),

    /// Work attached to a state transition failed.
    #[error("transition work failed: {message}")]
    Work {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Creates a work failure error.
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work {
            message: message.into(),
        }
    }
}

/// Result type alias for tether core operations.
pub type Result<T> = std::result::Result<T, Error>;
