//! Ping/pong heartbeat over a signaling channel.
//!
//! While the channel is open a ping is sent immediately and then once per
//! interval. Each ping carries an increasing id; only a pong echoing the
//! latest id counts. A matching pong yields the round trip time and an
//! estimate of the clock skew between the two ends, assuming symmetric
//! latency. Every tick that finds the previous ping unanswered reports the
//! current miss streak.
//!
//! Observer callbacks are queued on the scheduler, one task per observer,
//! and skipped if the observer was removed before its turn.

use crate::scheduler::{Scheduler, TimerHandle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::{Clock, ObserverId, ObserverSet};
use tether_transport::{
    ChannelEvent, ChannelObserver, PingPongFrame, PingPongKind, SignalFrame, SignalingChannel,
};

/// Receives heartbeat results. Both callbacks default to doing nothing.
pub trait HeartbeatObserver: Send + Sync {
    /// A pong for the latest ping arrived with a remote timestamp.
    fn on_pong_received(&self, _ping_id: u32, _clock_skew_ms: i64, _round_trip_ms: i64) {}

    /// A tick found `_consecutive` pings unanswered.
    fn on_pongs_missed(&self, _consecutive: u32) {}
}

/// Periodic ping sender bound to one channel.
///
/// Cloning yields another handle to the same heartbeat.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

struct HeartbeatInner {
    channel: Arc<dyn SignalingChannel>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    state: Mutex<PingState>,
    observers: ObserverSet<dyn HeartbeatObserver>,
    registration: Mutex<Option<ObserverId>>,
    generation: AtomicU64,
}

#[derive(Default)]
struct PingState {
    ping_id: u32,
    pongs_unaccounted_for: u32,
    ping_timestamp_local_ms: i64,
    timer: Option<TimerHandle>,
}

impl Heartbeat {
    /// Creates a stopped heartbeat for `channel`.
    #[must_use]
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                channel,
                scheduler,
                clock,
                interval,
                state: Mutex::new(PingState::default()),
                observers: ObserverSet::new(),
                registration: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: Arc<dyn HeartbeatObserver>) -> ObserverId {
        tracing::info!("adding a heartbeat observer");
        self.inner.observers.insert(observer)
    }

    /// Removes an observer. Queued notifications for it are dropped.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        tracing::info!("removing a heartbeat observer");
        self.inner.observers.remove(id)
    }

    /// Subscribes to the channel, pinging right away if it is already open.
    pub fn start(&self) {
        self.stop();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = Arc::new(ChannelListener {
            heartbeat: Arc::downgrade(&self.inner),
            generation,
        });
        let id = self.inner.channel.register_observer(listener);
        *self.inner.registration.lock() = Some(id);

        if self.inner.channel.is_ready() {
            self.inner.start_ping_interval();
        }
    }

    /// Stops pinging and unsubscribes from the channel.
    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.stop_ping_interval();
        self.inner.unregister();
    }

    /// Returns true while the ping interval is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .timer
            .as_ref()
            .is_some_and(TimerHandle::is_running)
    }

    /// Id of the latest ping, 0 when stopped.
    #[must_use]
    pub fn ping_id(&self) -> u32 {
        self.inner.state.lock().ping_id
    }

    /// Pings sent since the last matching pong.
    #[must_use]
    pub fn consecutive_pongs_unaccounted_for(&self) -> u32 {
        self.inner.state.lock().pongs_unaccounted_for
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Heartbeat")
            .field("interval", &self.inner.interval)
            .field("ping_id", &state.ping_id)
            .field("pongs_unaccounted_for", &state.pongs_unaccounted_for)
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

impl HeartbeatInner {
    /// Handles a channel event observed at local time `received_ms`.
    fn handle_channel_event(self: &Arc<Self>, event: &ChannelEvent, received_ms: i64) {
        match event {
            ChannelEvent::Opened => self.start_ping_interval(),
            ChannelEvent::Errored { message } => {
                tracing::warn!("stopped pinging ({message})");
                self.stop_ping_interval();
            }
            ChannelEvent::Closing => {
                tracing::info!("stopped pinging (closing)");
                self.stop_ping_interval();
            }
            ChannelEvent::Closed { code, .. } => {
                tracing::info!("stopped pinging (closed with {code})");
                self.stop_ping_interval();
            }
            ChannelEvent::FrameReceived(frame) => {
                let Some(ping_pong) = frame.as_ping_pong() else {
                    return;
                };
                match ping_pong.kind {
                    PingPongKind::Pong => {
                        self.handle_pong(ping_pong.ping_id, frame.timestamp_ms, received_ms);
                    }
                    PingPongKind::Ping => self.reply(ping_pong.ping_id),
                }
            }
        }
    }

    fn start_ping_interval(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timer = self.scheduler.interval(
            self.interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.ping();
                }
            }),
        );
        if let Some(previous) = self.state.lock().timer.replace(timer) {
            previous.stop();
        }
        self.ping();
    }

    fn stop_ping_interval(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.stop();
        }
        state.ping_id = 0;
        state.pongs_unaccounted_for = 0;
    }

    fn unregister(&self) {
        if let Some(id) = self.registration.lock().take() {
            self.channel.remove_observer(id);
        }
    }

    fn ping(&self) {
        let now = self.clock.now_ms();
        let (missed, ping_id) = {
            let mut state = self.state.lock();
            let missed = state.pongs_unaccounted_for;
            state.pongs_unaccounted_for = missed.saturating_add(1);
            state.ping_id = state.ping_id.wrapping_add(1);
            state.ping_timestamp_local_ms = now;
            (missed, state.ping_id)
        };

        if missed > 0 {
            tracing::warn!("missed pong {} time(s)", missed);
            self.notify(move |observer| observer.on_pongs_missed(missed));
        }

        let frame = SignalFrame::ping_pong(PingPongFrame::ping(ping_id)).with_timestamp(now);
        match self.channel.send(frame) {
            Ok(()) => tracing::debug!("sent ping {}", ping_id),
            Err(e) => tracing::warn!("failed to send ping {}: {}", ping_id, e),
        }
    }

    fn handle_pong(&self, ping_id: u32, remote_timestamp_ms: Option<i64>, received_ms: i64) {
        let ping_timestamp_ms = {
            let mut state = self.state.lock();
            if ping_id != state.ping_id {
                tracing::warn!("unexpected ping id {} (expected {})", ping_id, state.ping_id);
                return;
            }
            state.pongs_unaccounted_for = 0;
            state.ping_timestamp_local_ms
        };

        let Some(remote_ms) = remote_timestamp_ms else {
            return;
        };
        tracing::debug!("received pong {} with timestamp {}", ping_id, remote_ms);

        let Some((clock_skew_ms, round_trip_ms)) =
            skew_and_round_trip(ping_timestamp_ms, received_ms, remote_ms)
        else {
            tracing::warn!(
                "discarding pong {} with out of range timestamp {}",
                ping_id,
                remote_ms
            );
            return;
        };
        tracing::info!(
            "local clock skew estimate={}ms from ping-pong time={}ms",
            clock_skew_ms,
            round_trip_ms
        );
        self.notify(move |observer| {
            observer.on_pong_received(ping_id, clock_skew_ms, round_trip_ms);
        });
    }

    fn reply(&self, ping_id: u32) {
        let frame = SignalFrame::ping_pong(PingPongFrame::pong(ping_id))
            .with_timestamp(self.clock.now_ms());
        if let Err(e) = self.channel.send(frame) {
            tracing::warn!("failed to answer ping {}: {}", ping_id, e);
        }
    }

    fn notify<F>(&self, callback: F)
    where
        F: Fn(&dyn HeartbeatObserver) + Clone + Send + 'static,
    {
        for (id, observer) in self.observers.snapshot() {
            let observers = self.observers.clone();
            let callback = callback.clone();
            self.scheduler.defer(Box::new(move || {
                if observers.contains(id) {
                    callback(observer.as_ref());
                }
            }));
        }
    }
}

impl Drop for HeartbeatInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.stop();
        }
        self.unregister();
    }
}

/// Remote send time of the pong, assuming the reply left halfway through
/// the round trip. Halves round up.
fn estimate_remote_send_time(remote_ms: i64, round_trip_ms: i64) -> i64 {
    (remote_ms as f64 - round_trip_ms as f64 / 2.0 + 0.5).floor() as i64
}

/// Clock skew and round trip of a ping sent at `ping_ms`, answered at
/// `received_ms` by a pong stamped `remote_ms`. `None` when the timestamps
/// do not fit in an `i64` millisecond range.
fn skew_and_round_trip(ping_ms: i64, received_ms: i64, remote_ms: i64) -> Option<(i64, i64)> {
    let round_trip_ms = received_ms.checked_sub(ping_ms)?;
    let estimated_remote_ping_ms = estimate_remote_send_time(remote_ms, round_trip_ms);
    let clock_skew_ms = ping_ms.checked_sub(estimated_remote_ping_ms)?;
    Some((clock_skew_ms, round_trip_ms))
}

struct ChannelListener {
    heartbeat: Weak<HeartbeatInner>,
    generation: u64,
}

impl ChannelObserver for ChannelListener {
    fn on_channel_event(&self, event: &ChannelEvent) {
        let Some(inner) = self.heartbeat.upgrade() else {
            return;
        };
        let heartbeat = Weak::clone(&self.heartbeat);
        let generation = self.generation;
        let event = event.clone();
        let received_ms = inner.clock.now_ms();
        inner.scheduler.defer(Box::new(move || {
            let Some(inner) = heartbeat.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.handle_channel_event(&event, received_ms);
            }
        }));
    }
}
