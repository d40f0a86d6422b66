//! Timer and task scheduling.
//!
//! Every callback of a [`Scheduler`] runs on one logical thread: deferred
//! tasks and timer callbacks are executed one at a time, in submission
//! order. Session components rely on this to mutate their state without
//! interleaving.

use crate::error::ClientError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_core::ManualClock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// One-shot task.
pub type Task = Box<dyn FnOnce() + Send>;

/// Task run on every tick of an interval.
pub type RepeatingTask = Box<dyn FnMut() + Send>;

/// Source of delayed, repeating and next-turn callbacks.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Runs `task` once after `delay`.
    fn timeout(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Runs `task` every `period`, first one period from now.
    fn interval(&self, period: Duration, task: RepeatingTask) -> TimerHandle;

    /// Runs `task` on a later turn.
    fn defer(&self, task: Task);
}

/// Cancellable handle to a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerState>,
}

struct TimerState {
    running: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(TimerState {
                running: AtomicBool::new(true),
                abort: Mutex::new(None),
            }),
        }
    }

    /// Stops the timer. Its callback will not run afterwards.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            if let Some(abort) = self.inner.abort.lock().take() {
                abort.abort();
            }
        }
    }

    /// Returns true until the timer is stopped or, for a timeout, has fired.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn attach(&self, abort: AbortHandle) {
        let mut slot = self.inner.abort.lock();
        if self.is_running() {
            *slot = Some(abort);
        } else {
            abort.abort();
        }
    }

    /// Claims a one-shot timer for firing.
    fn claim(&self) -> bool {
        self.inner.running.swap(false, Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Scheduler backed by a tokio runtime.
///
/// Callbacks are funnelled through a single worker task, so they never run
/// concurrently with each other even on a multi-threaded runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    queue: mpsc::UnboundedSender<Task>,
}

impl TokioScheduler {
    /// Creates a scheduler on the runtime of the calling context.
    ///
    /// # Errors
    /// Returns `ClientError::NoRuntime` when called outside a tokio runtime.
    pub fn current() -> Result<Self, ClientError> {
        let handle = Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;
        Ok(Self::from_handle(handle))
    }

    /// Creates a scheduler on the given runtime.
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        let (queue, mut tasks) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = tasks.recv().await {
                task();
            }
        });
        Self { handle, queue }
    }

    fn submit(queue: &mpsc::UnboundedSender<Task>, task: Task) {
        if queue.send(task).is_err() {
            tracing::warn!("scheduler worker is gone, dropping task");
        }
    }
}

impl Scheduler for TokioScheduler {
    fn timeout(&self, delay: Duration, task: Task) -> TimerHandle {
        let timer = TimerHandle::new();
        let fire = timer.clone();
        let queue = self.queue.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            Self::submit(
                &queue,
                Box::new(move || {
                    if fire.claim() {
                        task();
                    }
                }),
            );
        });
        timer.attach(join.abort_handle());
        timer
    }

    fn interval(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        let timer = TimerHandle::new();
        let tick = timer.clone();
        let queue = self.queue.clone();
        let task = Arc::new(Mutex::new(task));
        let period = period.max(Duration::from_millis(1));
        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick.is_running() {
                    break;
                }
                let tick = tick.clone();
                let task = Arc::clone(&task);
                Self::submit(
                    &queue,
                    Box::new(move || {
                        if tick.is_running() {
                            (task.lock().as_mut())();
                        }
                    }),
                );
            }
        });
        timer.attach(join.abort_handle());
        timer
    }

    fn defer(&self, task: Task) {
        Self::submit(&self.queue, task);
    }
}

/// Scheduler driven by hand, for deterministic tests.
///
/// Nothing runs until [`run_deferred`](Self::run_deferred) or
/// [`advance`](Self::advance) is called. When built with a [`ManualClock`],
/// advancing the scheduler moves the clock along with it.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
    clock: Option<ManualClock>,
}

#[derive(Default)]
struct ManualState {
    now_ms: u64,
    next_seq: u64,
    deferred: VecDeque<Task>,
    timers: Vec<ManualTimer>,
}

struct ManualTimer {
    due_ms: u64,
    seq: u64,
    handle: TimerHandle,
    kind: ManualTimerKind,
}

enum ManualTimerKind {
    Once(Option<Task>),
    Repeat {
        period_ms: u64,
        task: Arc<Mutex<RepeatingTask>>,
    },
}

impl ManualScheduler {
    /// Creates a scheduler with its own notion of time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler that advances `clock` as time passes.
    #[must_use]
    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            state: Arc::default(),
            clock: Some(clock),
        }
    }

    /// Milliseconds elapsed since creation.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.state.lock().now_ms
    }

    /// Number of timers that have not been stopped or fired.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|timer| timer.handle.is_running())
            .count()
    }

    /// Runs deferred tasks until none are left. Returns how many ran.
    pub fn run_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.state.lock().deferred.pop_front();
            let Some(task) = next else {
                return ran;
            };
            task();
            ran += 1;
        }
    }

    /// Moves time forward by `delta`, firing due timers in order and running
    /// deferred tasks after each one.
    pub fn advance(&self, delta: Duration) {
        let target = self.elapsed_ms() + duration_ms(delta);
        self.run_deferred();
        while let Some(fire) = self.next_due(target) {
            fire();
            self.run_deferred();
        }
        self.move_to(target);
        self.run_deferred();
    }

    fn next_due(&self, target: u64) -> Option<Task> {
        let mut state = self.state.lock();
        state.timers.retain(|timer| timer.handle.is_running());
        let index = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, timer)| timer.due_ms <= target)
            .min_by_key(|(_, timer)| (timer.due_ms, timer.seq))
            .map(|(index, _)| index)?;

        let due_ms = state.timers[index].due_ms;
        let previous = state.now_ms;
        state.now_ms = due_ms;
        if let Some(clock) = &self.clock {
            clock.advance(due_ms.saturating_sub(previous) as i64);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let timer = &mut state.timers[index];
        let handle = timer.handle.clone();
        match &mut timer.kind {
            ManualTimerKind::Once(task) => {
                let task = task.take();
                Some(Box::new(move || {
                    if let Some(task) = task {
                        if handle.claim() {
                            task();
                        }
                    }
                }))
            }
            ManualTimerKind::Repeat { period_ms, task } => {
                timer.due_ms += (*period_ms).max(1);
                timer.seq = seq;
                let task = Arc::clone(task);
                Some(Box::new(move || {
                    if handle.is_running() {
                        (task.lock().as_mut())();
                    }
                }))
            }
        }
    }

    fn move_to(&self, target: u64) {
        let mut state = self.state.lock();
        let previous = state.now_ms;
        if target > previous {
            state.now_ms = target;
            if let Some(clock) = &self.clock {
                clock.advance((target - previous) as i64);
            }
        }
    }

    fn add_timer(&self, delay: Duration, kind: ManualTimerKind) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due_ms = state.now_ms + duration_ms(delay);
        state.timers.push(ManualTimer {
            due_ms,
            seq,
            handle: handle.clone(),
            kind,
        });
        handle
    }
}

impl Scheduler for ManualScheduler {
    fn timeout(&self, delay: Duration, task: Task) -> TimerHandle {
        self.add_timer(delay, ManualTimerKind::Once(Some(task)))
    }

    fn interval(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        self.add_timer(
            period,
            ManualTimerKind::Repeat {
                period_ms: duration_ms(period),
                task: Arc::new(Mutex::new(task)),
            },
        )
    }

    fn defer(&self, task: Task) {
        self.state.lock().deferred.push_back(task);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualScheduler")
            .field("now_ms", &state.now_ms)
            .field("deferred", &state.deferred.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tether_core::Clock;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, bump)
    }

    #[test]
    fn test_manual_timeout_fires_once() {
        let scheduler = ManualScheduler::new();
        let (count, bump) = counter();
        let timer = scheduler.timeout(Duration::from_millis(100), Box::new(bump));

        scheduler.advance(Duration::from_millis(99));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_running());

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_stopped_timeout_never_fires() {
        let scheduler = ManualScheduler::new();
        let (count, bump) = counter();
        let timer = scheduler.timeout(Duration::from_millis(10), Box::new(bump));

        timer.stop();
        timer.stop();
        scheduler.advance(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_manual_interval_ticks_each_period() {
        let scheduler = ManualScheduler::new();
        let (count, bump) = counter();
        let timer = scheduler.interval(Duration::from_millis(10), Box::new(bump));

        scheduler.advance(Duration::from_millis(35));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timer.stop();
        scheduler.advance(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_manual_defer_runs_in_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            scheduler.defer(Box::new(move || order.lock().push(i)));
        }

        assert!(order.lock().is_empty());
        assert_eq!(scheduler.run_deferred(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_manual_clock_follows_timers() {
        let clock = ManualClock::new(1_000);
        let scheduler = ManualScheduler::with_clock(clock.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            let clock = clock.clone();
            scheduler.timeout(
                Duration::from_millis(40),
                Box::new(move || seen.lock().push(clock.now_ms())),
            );
        }

        scheduler.advance(Duration::from_millis(100));
        assert_eq!(*seen.lock(), vec![1_040]);
        assert_eq!(clock.now_ms(), 1_100);
        assert_eq!(scheduler.elapsed_ms(), 100);
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(ClientError::NoRuntime(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timeout_and_stop() {
        let scheduler = TokioScheduler::current().unwrap();
        let (count, bump) = counter();

        let fired = scheduler.timeout(Duration::from_millis(50), Box::new(bump.clone()));
        let stopped = scheduler.timeout(Duration::from_millis(50), Box::new(bump));
        stopped.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!fired.is_running());
        assert!(!stopped.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_interval_first_tick_after_period() {
        let scheduler = TokioScheduler::current().unwrap();
        let (count, bump) = counter();
        let timer = scheduler.interval(Duration::from_millis(100), Box::new(bump));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(260)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timer.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_tokio_defer_preserves_order() {
        let scheduler = TokioScheduler::current().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            let tx = tx.clone();
            scheduler.defer(Box::new(move || {
                let _ = tx.send(i);
            }));
        }

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }
}
