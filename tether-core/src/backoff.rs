//! Full jitter exponential backoff.
//!
//! The wait before retry `n` is drawn uniformly from
//! `[fixed, fixed + min(long, short * 2^n))`. The fixed floor keeps a minimum
//! spacing between attempts while the jitter spreads reconnecting clients
//! apart.

use crate::error::BackoffError;

/// Produces the wait time before the next retry.
pub trait Backoff: Send {
    /// Returns the number of milliseconds to wait before the next retry.
    ///
    /// # Errors
    /// Returns `BackoffError::RetryLimitExceeded` when the policy has no
    /// attempts left.
    fn next_backoff_amount_ms(&mut self) -> Result<f64, BackoffError>;

    /// Returns the generator to its initial retry index.
    fn reset(&mut self);

    /// Creates a new policy with the same bounds and untouched state.
    fn fresh(&self) -> Box<dyn Backoff>;
}

/// Unlimited full jitter backoff with a fixed floor.
#[derive(Debug, Clone)]
pub struct FullJitterBackoff {
    fixed_wait_ms: f64,
    short_backoff_ms: f64,
    long_backoff_ms: f64,
    current_retry: u32,
}

impl FullJitterBackoff {
    /// Creates a new backoff. Negative (or NaN) arguments are treated as zero.
    ///
    /// # Arguments
    /// * `fixed_wait_ms` - Floor added to every wait
    /// * `short_backoff_ms` - Cap for the first retry, doubled on each retry
    /// * `long_backoff_ms` - Upper bound for the doubling cap
    #[must_use]
    pub fn new(fixed_wait_ms: f64, short_backoff_ms: f64, long_backoff_ms: f64) -> Self {
        Self {
            fixed_wait_ms: fixed_wait_ms.max(0.0),
            short_backoff_ms: short_backoff_ms.max(0.0),
            long_backoff_ms: long_backoff_ms.max(0.0),
            current_retry: 0,
        }
    }

    /// Returns the number of delays handed out since the last reset.
    #[must_use]
    pub fn current_retry(&self) -> u32 {
        self.current_retry
    }

    /// Returns the jitter range for the given retry index.
    #[must_use]
    pub fn cap_for_retry(&self, retry: u32) -> f64 {
        // 2^1023 is the largest finite power of two; beyond it the product
        // saturates to the long bound anyway.
        let growth = 2f64.powi(retry.min(1023) as i32);
        (self.short_backoff_ms * growth).min(self.long_backoff_ms)
    }

    /// Returns the fixed floor in milliseconds.
    #[must_use]
    pub fn fixed_wait_ms(&self) -> f64 {
        self.fixed_wait_ms
    }
}

impl Backoff for FullJitterBackoff {
    fn next_backoff_amount_ms(&mut self) -> Result<f64, BackoffError> {
        let capped = self.cap_for_retry(self.current_retry);
        let wait = rand::random::<f64>() * capped + self.fixed_wait_ms;
        self.current_retry = self.current_retry.saturating_add(1);
        Ok(wait)
    }

    fn reset(&mut self) {
        self.current_retry = 0;
    }

    fn fresh(&self) -> Box<dyn Backoff> {
        Box::new(Self::new(
            self.fixed_wait_ms,
            self.short_backoff_ms,
            self.long_backoff_ms,
        ))
    }
}

/// Full jitter backoff that refuses to hand out more than `limit` delays.
///
/// The attempt budget spans the whole lifetime of the instance: `reset()`
/// restarts the exponential growth but does not refill the budget. Build a
/// new instance (or call [`Backoff::fresh`]) to get a full budget again.
#[derive(Debug, Clone)]
pub struct FullJitterLimitedBackoff {
    inner: FullJitterBackoff,
    limit: u32,
    attempts: u32,
}

impl FullJitterLimitedBackoff {
    /// Creates a new limited backoff.
    ///
    /// # Arguments
    /// * `fixed_wait_ms` - Floor added to every wait
    /// * `short_backoff_ms` - Cap for the first retry, doubled on each retry
    /// * `long_backoff_ms` - Upper bound for the doubling cap
    /// * `limit` - Number of delays handed out before failing
    #[must_use]
    pub fn new(
        fixed_wait_ms: f64,
        short_backoff_ms: f64,
        long_backoff_ms: f64,
        limit: u32,
    ) -> Self {
        Self {
            inner: FullJitterBackoff::new(fixed_wait_ms, short_backoff_ms, long_backoff_ms),
            limit,
            attempts: 0,
        }
    }

    /// Returns the number of calls made over the lifetime of this instance.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the configured attempt limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

impl Backoff for FullJitterLimitedBackoff {
    fn next_backoff_amount_ms(&mut self) -> Result<f64, BackoffError> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.limit {
            return Err(BackoffError::RetryLimitExceeded { limit: self.limit });
        }
        self.inner.next_backoff_amount_ms()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn fresh(&self) -> Box<dyn Backoff> {
        Box::new(Self {
            inner: FullJitterBackoff::new(
                self.inner.fixed_wait_ms,
                self.inner.short_backoff_ms,
                self.inner.long_backoff_ms,
            ),
            limit: self.limit,
            attempts: 0,
        })
    }
}
