//! Reconnection logic for signaling sessions.
//!
//! [`ReconnectController`] decides whether a dropped session may be retried
//! and schedules the retry after a backoff delay. Two deadlines bound the
//! effort, both measured against `reconnect_timeout_ms`:
//! - time since the first connection attempt of the current cycle
//! - time since the session last reported activity, once it has reported any

use crate::scheduler::{Scheduler, Task, TimerHandle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Backoff, BackoffError, Clock};

/// Default time budget for reconnecting, in milliseconds.
pub const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 120_000;

struct PendingRetry {
    id: u64,
    timer: TimerHandle,
    on_cancel: Option<Task>,
}

/// Tracks reconnection state and schedules retries.
pub struct ReconnectController {
    reconnect_timeout_ms: u64,
    backoff: Box<dyn Backoff>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    should_reconnect: bool,
    only_restart_peer_connection: bool,
    first_connection_attempted: bool,
    first_connection_attempt_timestamp_ms: i64,
    last_active_timestamp_ms: Option<i64>,
    is_first_connection: bool,
    pending: Arc<Mutex<Option<PendingRetry>>>,
    next_retry_id: u64,
}

impl ReconnectController {
    /// Creates a controller with reconnection enabled.
    #[must_use]
    pub fn new(
        reconnect_timeout_ms: u64,
        backoff: Box<dyn Backoff>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut controller = Self {
            reconnect_timeout_ms,
            backoff,
            scheduler,
            clock,
            should_reconnect: true,
            only_restart_peer_connection: false,
            first_connection_attempted: false,
            first_connection_attempt_timestamp_ms: 0,
            last_active_timestamp_ms: None,
            is_first_connection: true,
            pending: Arc::new(Mutex::new(None)),
            next_retry_id: 0,
        };
        controller.reset();
        controller
    }

    /// Returns the reconnect time budget in milliseconds.
    #[must_use]
    pub fn reconnect_timeout_ms(&self) -> u64 {
        self.reconnect_timeout_ms
    }

    /// Cancels any pending retry and starts a new reconnection cycle.
    pub fn reset(&mut self) {
        self.cancel_pending();
        self.should_reconnect = true;
        self.only_restart_peer_connection = false;
        self.first_connection_attempted = false;
        self.first_connection_attempt_timestamp_ms = 0;
        self.last_active_timestamp_ms = None;
        self.backoff.reset();
    }

    /// Records a connection attempt. The first one after a reset starts the
    /// reconnect deadline.
    pub fn started_connection_attempt(&mut self, is_first_connection: bool) {
        self.is_first_connection = is_first_connection;
        if !self.first_connection_attempted {
            self.first_connection_attempted = true;
            self.first_connection_attempt_timestamp_ms = self.clock.now_ms();
        }
    }

    /// Returns true once an attempt was recorded in this cycle.
    #[must_use]
    pub fn has_started_connection_attempt(&self) -> bool {
        self.first_connection_attempted
    }

    /// Returns the flag passed to the latest
    /// [`started_connection_attempt`](Self::started_connection_attempt).
    #[must_use]
    pub fn is_first_connection(&self) -> bool {
        self.is_first_connection
    }

    /// Prevents further retries. A retry already scheduled is left alone.
    pub fn disable_reconnect(&mut self) {
        self.should_reconnect = false;
    }

    /// Disables reconnection and cancels the pending retry, running its
    /// cancel continuation.
    pub fn cancel(&mut self) {
        self.disable_reconnect();
        self.cancel_pending();
    }

    /// Marks that only the peer connection needs restarting.
    pub fn enable_restart_peer_connection(&mut self) {
        self.only_restart_peer_connection = true;
    }

    /// Returns true if only the peer connection needs restarting.
    #[must_use]
    pub fn should_only_restart_peer_connection(&self) -> bool {
        self.only_restart_peer_connection
    }

    /// Returns true while a retry is waiting for its timer.
    #[must_use]
    pub fn has_pending_retry(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Records the last time the session saw traffic from the remote side.
    pub fn set_last_active_timestamp_ms(&mut self, timestamp_ms: i64) {
        self.last_active_timestamp_ms = Some(timestamp_ms);
    }

    /// Returns true when either reconnect deadline has passed.
    #[must_use]
    pub fn has_past_reconnect_deadline(&self) -> bool {
        let now = self.clock.now_ms();
        let timeout = i64::try_from(self.reconnect_timeout_ms).unwrap_or(i64::MAX);

        let spent_reconnecting = if self.first_connection_attempted {
            now.saturating_sub(self.first_connection_attempt_timestamp_ms)
        } else {
            0
        };
        let inactive_too_long = self
            .last_active_timestamp_ms
            .is_some_and(|last_active| now.saturating_sub(last_active) >= timeout);

        spent_reconnecting >= timeout || inactive_too_long
    }

    /// Schedules `retry` after the next backoff delay if reconnecting is
    /// still allowed. Returns whether a retry was scheduled.
    ///
    /// A retry already pending is cancelled first and its `on_cancel`
    /// continuation runs. When the new retry is cancelled later, its own
    /// `on_cancel` runs instead of `retry`.
    ///
    /// # Errors
    /// Returns `BackoffError` when the backoff policy has run out of retries.
    pub fn retry_with_backoff<R>(
        &mut self,
        retry: R,
        on_cancel: Option<Task>,
    ) -> Result<bool, BackoffError>
    where
        R: FnOnce() + Send + 'static,
    {
        self.cancel_pending();

        if !self.should_reconnect {
            tracing::info!("reconnect disabled, not retrying");
            return Ok(false);
        }
        if self.has_past_reconnect_deadline() {
            tracing::warn!(
                "reconnect deadline of {} ms has passed, not retrying",
                self.reconnect_timeout_ms
            );
            return Ok(false);
        }

        let delay_ms = self.backoff.next_backoff_amount_ms()?;
        let delay = Duration::try_from_secs_f64(delay_ms / 1000.0).unwrap_or(Duration::MAX);
        self.next_retry_id += 1;
        let id = self.next_retry_id;
        tracing::info!("retrying connection in {:.0} ms", delay_ms);

        let pending = Arc::clone(&self.pending);
        let mut slot = self.pending.lock();
        let timer = self.scheduler.timeout(
            delay,
            Box::new(move || {
                let due = pending.lock().take_if(|entry| entry.id == id);
                if due.is_some() {
                    retry();
                }
            }),
        );
        *slot = Some(PendingRetry {
            id,
            timer,
            on_cancel,
        });
        Ok(true)
    }

    /// Creates a controller with the same timeout and backoff policy and
    /// none of this controller's state.
    #[must_use]
    pub fn clone_fresh(&self) -> Self {
        Self::new(
            self.reconnect_timeout_ms,
            self.backoff.fresh(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.clock),
        )
    }

    fn cancel_pending(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        tracing::debug!("cancelling pending retry {}", pending.id);
        pending.timer.stop();
        if let Some(on_cancel) = pending.on_cancel {
            on_cancel();
        }
    }
}

impl fmt::Debug for ReconnectController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectController")
            .field("reconnect_timeout_ms", &self.reconnect_timeout_ms)
            .field("should_reconnect", &self.should_reconnect)
            .field("first_connection_attempted", &self.first_connection_attempted)
            .field("last_active_timestamp_ms", &self.last_active_timestamp_ms)
            .field("pending_retry", &self.has_pending_retry())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::{FullJitterBackoff, FullJitterLimitedBackoff, ManualClock};

    fn controller(
        timeout_ms: u64,
        backoff: Box<dyn Backoff>,
    ) -> (ReconnectController, ManualScheduler) {
        let clock = ManualClock::new(10_000);
        let scheduler = ManualScheduler::with_clock(clock.clone());
        let controller = ReconnectController::new(
            timeout_ms,
            backoff,
            Arc::new(scheduler.clone()),
            Arc::new(clock),
        );
        (controller, scheduler)
    }

    // Backoff with a fixed 10 ms delay and no jitter.
    fn fixed() -> Box<dyn Backoff> {
        Box::new(FullJitterBackoff::new(10.0, 0.0, 0.0))
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + use<> {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_initial_state() {
        let (controller, _) = controller(1_000, fixed());
        assert!(controller.is_first_connection());
        assert!(!controller.has_started_connection_attempt());
        assert!(!controller.should_only_restart_peer_connection());
        assert!(!controller.has_past_reconnect_deadline());
        assert!(!controller.has_pending_retry());
    }

    #[test]
    fn test_retry_fires_after_backoff() {
        let (mut controller, scheduler) = controller(1_000, fixed());
        let retries = Arc::new(AtomicUsize::new(0));

        assert_eq!(controller.retry_with_backoff(counting(&retries), None), Ok(true));
        assert!(controller.has_pending_retry());

        scheduler.advance(Duration::from_millis(9));
        assert_eq!(retries.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert!(!controller.has_pending_retry());
    }

    #[test]
    fn test_deadline_denies_until_reset() {
        let (mut controller, scheduler) = controller(50, fixed());
        controller.started_connection_attempt(true);
        assert!(controller.has_started_connection_attempt());

        scheduler.advance(Duration::from_millis(50));
        for _ in 0..3 {
            assert_eq!(controller.retry_with_backoff(|| {}, None), Ok(false));
        }
        assert!(controller.has_past_reconnect_deadline());

        controller.reset();
        assert_eq!(controller.retry_with_backoff(|| {}, None), Ok(true));
    }

    #[test]
    fn test_first_attempt_timestamp_set_once() {
        let (mut controller, scheduler) = controller(50, fixed());
        controller.started_connection_attempt(true);
        scheduler.advance(Duration::from_millis(30));
        controller.started_connection_attempt(false);
        assert!(!controller.is_first_connection());

        scheduler.advance(Duration::from_millis(25));
        assert!(controller.has_past_reconnect_deadline());
    }

    #[test]
    fn test_inactivity_deadline() {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::with_clock(clock.clone());
        let mut controller = ReconnectController::new(
            100,
            fixed(),
            Arc::new(scheduler.clone()),
            Arc::new(clock.clone()),
        );

        scheduler.advance(Duration::from_millis(500));
        assert!(!controller.has_past_reconnect_deadline());

        controller.set_last_active_timestamp_ms(clock.now_ms());
        scheduler.advance(Duration::from_millis(99));
        assert!(!controller.has_past_reconnect_deadline());
        scheduler.advance(Duration::from_millis(1));
        assert!(controller.has_past_reconnect_deadline());
        assert_eq!(controller.retry_with_backoff(|| {}, None), Ok(false));
    }

    #[test]
    fn test_disable_keeps_scheduled_retry() {
        let (mut controller, scheduler) = controller(1_000, fixed());
        let retries = Arc::new(AtomicUsize::new(0));

        assert_eq!(controller.retry_with_backoff(counting(&retries), None), Ok(true));
        controller.disable_reconnect();
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(retries.load(Ordering::SeqCst), 1);

        assert_eq!(controller.retry_with_backoff(counting(&retries), None), Ok(false));
    }

    #[test]
    fn test_cancel_runs_continuation_once() {
        let (mut controller, scheduler) = controller(1_000, fixed());
        let retries = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));

        let scheduled = controller
            .retry_with_backoff(counting(&retries), Some(Box::new(counting(&cancels))))
            .unwrap();
        assert!(scheduled);

        controller.cancel();
        controller.cancel();
        scheduler.advance(Duration::from_millis(100));

        assert_eq!(retries.load(Ordering::SeqCst), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_timers(), 0);
        assert_eq!(controller.retry_with_backoff(|| {}, None), Ok(false));
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let (mut controller, scheduler) = controller(1_000, fixed());
        let cancels = Arc::new(AtomicUsize::new(0));

        controller
            .retry_with_backoff(|| {}, Some(Box::new(counting(&cancels))))
            .unwrap();
        scheduler.advance(Duration::from_millis(10));
        controller.cancel();

        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_retry_replaces_pending_one() {
        let (mut controller, scheduler) = controller(1_000, fixed());
        let first = Arc::new(AtomicUsize::new(0));
        let first_cancel = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        controller
            .retry_with_backoff(counting(&first), Some(Box::new(counting(&first_cancel))))
            .unwrap();
        controller.retry_with_backoff(counting(&second), None).unwrap();
        assert_eq!(first_cancel.load(Ordering::SeqCst), 1);

        scheduler.advance(Duration::from_millis(50));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_limit_surfaces() {
        let (mut controller, _) =
            controller(1_000, Box::new(FullJitterLimitedBackoff::new(0.0, 0.0, 0.0, 1)));

        assert_eq!(controller.retry_with_backoff(|| {}, None), Ok(true));
        assert_eq!(
            controller.retry_with_backoff(|| {}, None),
            Err(BackoffError::RetryLimitExceeded { limit: 1 })
        );
        assert!(!controller.has_pending_retry());
    }

    #[test]
    fn test_reset_clears_restart_flag_and_cancels() {
        let (mut controller, _) = controller(1_000, fixed());
        let cancels = Arc::new(AtomicUsize::new(0));

        controller.enable_restart_peer_connection();
        assert!(controller.should_only_restart_peer_connection());
        controller
            .retry_with_backoff(|| {}, Some(Box::new(counting(&cancels))))
            .unwrap();

        controller.reset();
        assert!(!controller.should_only_restart_peer_connection());
        assert!(!controller.has_pending_retry());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_fresh_is_independent() {
        let (mut controller, _) =
            controller(75, Box::new(FullJitterLimitedBackoff::new(0.0, 0.0, 0.0, 1)));
        controller.started_connection_attempt(false);
        controller.retry_with_backoff(|| {}, None).unwrap();
        controller.disable_reconnect();

        let mut fresh = controller.clone_fresh();
        assert_eq!(fresh.reconnect_timeout_ms(), 75);
        assert!(!fresh.has_started_connection_attempt());
        assert!(!fresh.has_pending_retry());
        assert!(controller.has_pending_retry());
        assert_eq!(fresh.retry_with_backoff(|| {}, None), Ok(true));
    }
}
