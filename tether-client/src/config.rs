//! Session configuration.

use crate::error::ClientError;
use crate::reconnect::DEFAULT_RECONNECT_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_core::{Backoff, FullJitterBackoff, FullJitterLimitedBackoff};

/// Tunables of a signaling session. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time budget for reconnecting after the first failed attempt.
    pub reconnect_timeout_ms: u64,
    /// Minimum delay before every retry.
    pub reconnect_fixed_wait_ms: u64,
    /// Jitter cap of the first retry; doubles with every retry.
    pub reconnect_short_backoff_ms: u64,
    /// Upper bound of the jitter cap.
    pub reconnect_long_backoff_ms: u64,
    /// Hard limit on retries, unlimited when absent.
    pub max_reconnect_attempts: Option<u32>,
    /// Interval between heartbeat pings.
    pub ping_interval_ms: u64,
    /// Missed pongs after which the connection is dropped.
    pub missed_pongs_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout_ms: DEFAULT_RECONNECT_TIMEOUT_MS,
            reconnect_fixed_wait_ms: 0,
            reconnect_short_backoff_ms: 1_000,
            reconnect_long_backoff_ms: 5_000,
            max_reconnect_attempts: None,
            ping_interval_ms: 10_000,
            missed_pongs_threshold: 4,
        }
    }
}

impl SessionConfig {
    /// Sets the reconnect time budget.
    #[must_use]
    pub fn reconnect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reconnect_timeout_ms = timeout_ms;
        self
    }

    /// Sets the backoff parameters.
    #[must_use]
    pub fn backoff_ms(mut self, fixed_wait_ms: u64, short_ms: u64, long_ms: u64) -> Self {
        self.reconnect_fixed_wait_ms = fixed_wait_ms;
        self.reconnect_short_backoff_ms = short_ms;
        self.reconnect_long_backoff_ms = long_ms;
        self
    }

    /// Limits the number of retries.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn ping_interval_ms(mut self, interval_ms: u64) -> Self {
        self.ping_interval_ms = interval_ms;
        self
    }

    /// Sets how many missed pongs drop the connection.
    #[must_use]
    pub fn missed_pongs_threshold(mut self, threshold: u32) -> Self {
        self.missed_pongs_threshold = threshold;
        self
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns `ClientError::InvalidConfig` for a zero ping interval or
    /// missed pong threshold.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.ping_interval_ms == 0 {
            return Err(ClientError::invalid_config("ping interval must be positive"));
        }
        if self.missed_pongs_threshold == 0 {
            return Err(ClientError::invalid_config(
                "missed pongs threshold must be positive",
            ));
        }
        Ok(())
    }

    /// Builds the backoff policy described by this configuration.
    #[must_use]
    pub fn build_backoff(&self) -> Box<dyn Backoff> {
        let fixed = self.reconnect_fixed_wait_ms as f64;
        let short = self.reconnect_short_backoff_ms as f64;
        let long = self.reconnect_long_backoff_ms as f64;
        match self.max_reconnect_attempts {
            Some(limit) => Box::new(FullJitterLimitedBackoff::new(fixed, short, long, limit)),
            None => Box::new(FullJitterBackoff::new(fixed, short, long)),
        }
    }
}
