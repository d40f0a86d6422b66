//! Signaling session with automatic reconnection.
//!
//! [`SignalingSession`] drives one logical connection through the
//! [`SessionStateController`]: it opens channels through a [`Connector`],
//! runs a [`Heartbeat`] while connected, and on an unexpected close asks the
//! [`ReconnectController`] for another attempt.
//!
//! Channel and heartbeat events are handled on scheduler turns, never inside
//! the callback that reported them. Locks are taken in the order
//! state controller, then resources.

use crate::config::SessionConfig;
use crate::heartbeat::{Heartbeat, HeartbeatObserver};
use crate::reconnect::ReconnectController;
use crate::scheduler::Scheduler;
use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tether_core::{
    Action, Clock, ConnectionState, ObserverId, SessionStateController, TransitionResult,
};
use tether_transport::{
    ChannelEvent, ChannelObserver, Connector, SignalBody, SignalFrame, SignalingChannel,
    TransportError, close_code, is_reconnectable_close,
};
use tokio::sync::mpsc;

/// Events reported by a session to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A channel is being opened.
    Connecting {
        /// True when this attempt follows a lost connection.
        reconnecting: bool,
    },
    /// The channel is open and the heartbeat is running.
    Connected,
    /// Application data arrived.
    Message(Bytes),
    /// The heartbeat got an answer.
    PongReceived {
        /// Id of the answered ping.
        ping_id: u32,
        /// Estimated local clock minus remote clock.
        clock_skew_ms: i64,
        /// Round trip time of the ping.
        round_trip_ms: i64,
    },
    /// The heartbeat found unanswered pings.
    PongsMissed(u32),
    /// The session is disconnected and will not reconnect on its own.
    Disconnected {
        /// Close code of the last channel.
        code: u16,
        /// Close reason of the last channel.
        reason: String,
    },
}

/// Receiver of [`SessionEvent`]s.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Handle to a signaling session. Clones refer to the same session.
#[derive(Clone)]
pub struct SignalingSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    controller: Mutex<SessionStateController>,
    resources: Mutex<Resources>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct Resources {
    reconnect: ReconnectController,
    channel: Option<Arc<dyn SignalingChannel>>,
    channel_observer: Option<ObserverId>,
    heartbeat: Option<(Heartbeat, ObserverId)>,
    connection: u64,
    closing: bool,
}

impl SignalingSession {
    pub(crate) fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let reconnect = ReconnectController::new(
            config.reconnect_timeout_ms,
            config.build_backoff(),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
        );
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                scheduler,
                clock,
                controller: Mutex::new(SessionStateController::new()),
                resources: Mutex::new(Resources {
                    reconnect,
                    channel: None,
                    channel_observer: None,
                    heartbeat: None,
                    connection: 0,
                    closing: false,
                }),
                events,
            }),
        }
    }

    /// Opens the first channel.
    pub fn start(&self) -> TransitionResult {
        self.inner.connect(false)
    }

    /// Closes the session. No reconnection happens afterwards.
    ///
    /// While waiting for a retry there is no transition to perform; the
    /// pending retry is cancelled instead and `NoTransitionAvailable` is
    /// returned. `Disconnected` is reported in both cases.
    pub fn stop(&self) -> TransitionResult {
        self.inner.resources.lock().reconnect.disable_reconnect();
        let work = self.inner.work(|inner| {
            inner.begin_disconnect();
            Ok(())
        });
        let result = self.inner.controller.lock().perform(Action::Disconnect, work);
        if result == TransitionResult::NoTransitionAvailable {
            let mut resources = self.inner.resources.lock();
            if resources.reconnect.has_pending_retry() {
                tracing::info!("cancelling pending reconnect");
                resources.reconnect.cancel();
            }
        }
        result
    }

    /// Replaces the open channel with a new one.
    pub fn reconnect(&self) -> TransitionResult {
        let work = self.inner.work(|inner| inner.reopen());
        self.inner.controller.lock().perform(Action::Reconnect, work)
    }

    /// Enters the updating state, running `work` on the way.
    pub fn begin_update<F>(&self, work: F) -> TransitionResult
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.controller.lock().perform(Action::Update, work)
    }

    /// Leaves the updating state, running `work` on the way.
    pub fn finish_update<F>(&self, work: F) -> TransitionResult
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.controller.lock().perform(Action::FinishUpdating, work)
    }

    /// Sends application data over the open channel.
    ///
    /// # Errors
    /// Returns `TransportError::NotOpen` when no channel is open.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        let channel = self.inner.resources.lock().channel.clone();
        let channel = channel.ok_or(TransportError::NotOpen)?;
        channel.send(SignalFrame::data(payload).with_timestamp(self.inner.clock.now_ms()))
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.inner.controller.lock().current_state()
    }

    /// Returns true while a reconnect attempt is waiting for its timer.
    #[must_use]
    pub fn has_pending_retry(&self) -> bool {
        self.inner.resources.lock().reconnect.has_pending_retry()
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

impl fmt::Debug for SignalingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingSession")
            .field("state", &self.current_state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    /// Wraps `f` as transition work that holds the session weakly.
    fn work<F>(
        self: &Arc<Self>,
        f: F,
    ) -> impl FnOnce() -> anyhow::Result<()> + Send + 'static + use<F>
    where
        F: FnOnce(&Arc<Self>) -> anyhow::Result<()> + Send + 'static,
    {
        let session = Arc::downgrade(self);
        move || match session.upgrade() {
            Some(inner) => f(&inner),
            None => Ok(()),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }

    fn connect(self: &Arc<Self>, reconnecting: bool) -> TransitionResult {
        let work = self.work(move |inner| inner.open_channel(reconnecting));
        self.controller.lock().perform(Action::Connect, work)
    }

    fn open_channel(self: &Arc<Self>, reconnecting: bool) -> anyhow::Result<()> {
        {
            let mut resources = self.resources.lock();
            if !reconnecting {
                resources.reconnect.reset();
            }
            resources.closing = false;
            resources.reconnect.started_connection_attempt(!reconnecting);
            resources.connection += 1;

            let listener = Arc::new(ChannelListener {
                session: Arc::downgrade(self),
                connection: resources.connection,
            });
            let (channel, id) = self
                .connector
                .open(listener)
                .context("failed to open signaling channel")?;
            resources.channel = Some(channel);
            resources.channel_observer = Some(id);
        }
        self.emit(SessionEvent::Connecting { reconnecting });
        Ok(())
    }

    fn finish_connecting(self: &Arc<Self>) -> anyhow::Result<()> {
        let heartbeat = {
            let mut resources = self.resources.lock();
            resources.reconnect.reset();
            let channel = resources
                .channel
                .clone()
                .context("no channel to finish connecting")?;
            let heartbeat = Heartbeat::new(
                channel,
                Arc::clone(&self.scheduler),
                Arc::clone(&self.clock),
                self.config.ping_interval(),
            );
            let listener = Arc::new(HeartbeatListener {
                session: Arc::downgrade(self),
                connection: resources.connection,
            });
            let id = heartbeat.add_observer(listener);
            resources.heartbeat = Some((heartbeat.clone(), id));
            heartbeat
        };
        heartbeat.start();
        self.emit(SessionEvent::Connected);
        Ok(())
    }

    fn reopen(self: &Arc<Self>) -> anyhow::Result<()> {
        let previous = {
            let mut resources = self.resources.lock();
            let channel = resources.channel.clone();
            Self::teardown(&mut resources);
            channel
        };
        if let Some(channel) = previous {
            channel.close(close_code::GOING_AWAY);
        }
        self.open_channel(true)
    }

    fn begin_disconnect(self: &Arc<Self>) {
        let (channel, heartbeat) = {
            let mut resources = self.resources.lock();
            resources.closing = true;
            resources.reconnect.cancel();
            (resources.channel.clone(), resources.heartbeat.take())
        };
        if let Some((heartbeat, id)) = heartbeat {
            heartbeat.remove_observer(id);
            heartbeat.stop();
        }
        match channel {
            Some(channel) => channel.close(close_code::NORMAL),
            None => {
                let inner = Arc::clone(self);
                self.scheduler.defer(Box::new(move || {
                    inner.finish_disconnect(close_code::NORMAL, "stopped".to_string());
                }));
            }
        }
    }

    /// Drops the heartbeat and the channel subscription. Events still queued
    /// for the old connection are ignored afterwards.
    fn teardown(resources: &mut Resources) {
        if let Some((heartbeat, id)) = resources.heartbeat.take() {
            heartbeat.remove_observer(id);
            heartbeat.stop();
        }
        if let Some(channel) = resources.channel.take() {
            if let Some(id) = resources.channel_observer.take() {
                channel.remove_observer(id);
            }
        }
        resources.connection += 1;
    }

    fn handle_channel_event(self: &Arc<Self>, connection: u64, event: ChannelEvent) {
        if self.resources.lock().connection != connection {
            tracing::debug!("ignoring event from a superseded channel");
            return;
        }
        match event {
            ChannelEvent::Opened => {
                let work = self.work(|inner| inner.finish_connecting());
                let result = self.controller.lock().perform(Action::FinishConnecting, work);
                if result != TransitionResult::Transitioned {
                    tracing::warn!("channel opened but session did not connect: {:?}", result);
                }
            }
            ChannelEvent::FrameReceived(frame) => {
                if let SignalBody::Data(payload) = frame.body {
                    self.emit(SessionEvent::Message(payload));
                }
            }
            ChannelEvent::Closing => {}
            ChannelEvent::Errored { message } => {
                tracing::warn!("signaling channel error: {}", message);
            }
            ChannelEvent::Closed { code, reason } => self.handle_closed(code, reason),
        }
    }

    fn handle_closed(self: &Arc<Self>, code: u16, reason: String) {
        let closing = self.resources.lock().closing;
        if closing {
            Self::teardown(&mut self.resources.lock());
            self.finish_disconnect(code, reason);
            return;
        }

        tracing::warn!("signaling channel closed with {} ({})", code, reason);
        let work = self.work(move |inner| {
            inner.fail(code, reason);
            Ok(())
        });
        let result = self.controller.lock().perform(Action::Fail, work);
        if result != TransitionResult::Transitioned {
            tracing::warn!("unable to fail session: {:?}", result);
        }
    }

    fn fail(self: &Arc<Self>, code: u16, reason: String) {
        let granted = {
            let mut resources = self.resources.lock();
            Self::teardown(&mut resources);
            is_reconnectable_close(code) && self.request_retry(&mut resources, code, &reason)
        };
        if granted {
            tracing::info!("connection lost with {}, will reconnect", code);
            return;
        }
        let inner = Arc::clone(self);
        self.scheduler.defer(Box::new(move || inner.finish_disconnect(code, reason)));
    }

    /// Asks the reconnect controller for another attempt. On cancellation
    /// the disconnect is finalized with `code` and `reason`, unless a new
    /// connection was opened in the meantime.
    fn request_retry(
        self: &Arc<Self>,
        resources: &mut Resources,
        code: u16,
        reason: &str,
    ) -> bool {
        let retry = {
            let session = Arc::downgrade(self);
            move || {
                if let Some(inner) = session.upgrade() {
                    inner.retry_now();
                }
            }
        };
        let on_cancel = {
            let session = Arc::downgrade(self);
            let reason = reason.to_string();
            let connection = resources.connection;
            move || {
                if let Some(inner) = session.upgrade() {
                    let scheduler = Arc::clone(&inner.scheduler);
                    scheduler.defer(Box::new(move || {
                        if inner.resources.lock().connection != connection {
                            tracing::debug!("retry superseded by a new connection");
                            return;
                        }
                        inner.finish_disconnect(code, reason);
                    }));
                }
            }
        };
        match resources.reconnect.retry_with_backoff(retry, Some(Box::new(on_cancel))) {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!("giving up reconnecting: {}", e);
                false
            }
        }
    }

    fn retry_now(self: &Arc<Self>) {
        {
            let mut controller = self.controller.lock();
            if controller.current_state() == ConnectionState::Disconnecting {
                let result = controller.perform(Action::FinishDisconnecting, || Ok(()));
                if result != TransitionResult::Transitioned {
                    tracing::warn!("unable to finish disconnecting before retry: {:?}", result);
                }
            }
        }
        if self.connect(true) != TransitionResult::TransitionFailed {
            return;
        }

        let reason = "failed to open signaling channel";
        let granted = {
            let mut resources = self.resources.lock();
            self.request_retry(&mut resources, close_code::ABNORMAL, reason)
        };
        if !granted {
            self.emit(SessionEvent::Disconnected {
                code: close_code::ABNORMAL,
                reason: reason.to_string(),
            });
        }
    }

    fn finish_disconnect(&self, code: u16, reason: String) {
        {
            let mut controller = self.controller.lock();
            if controller.current_state() == ConnectionState::Disconnecting {
                let result = controller.perform(Action::FinishDisconnecting, || Ok(()));
                if result != TransitionResult::Transitioned {
                    tracing::warn!("unable to finish disconnecting: {:?}", result);
                }
            }
        }
        tracing::info!("session disconnected with {} ({})", code, reason);
        self.emit(SessionEvent::Disconnected { code, reason });
    }

    fn handle_pong(&self, connection: u64, ping_id: u32, clock_skew_ms: i64, round_trip_ms: i64) {
        {
            let mut resources = self.resources.lock();
            if resources.connection != connection {
                return;
            }
            resources
                .reconnect
                .set_last_active_timestamp_ms(self.clock.now_ms());
        }
        self.emit(SessionEvent::PongReceived {
            ping_id,
            clock_skew_ms,
            round_trip_ms,
        });
    }

    fn handle_missed_pongs(&self, connection: u64, consecutive: u32) {
        let channel = {
            let resources = self.resources.lock();
            if resources.connection != connection {
                return;
            }
            resources.channel.clone()
        };
        self.emit(SessionEvent::PongsMissed(consecutive));

        if consecutive >= self.config.missed_pongs_threshold {
            tracing::warn!(
                "missed {} pongs in a row, closing signaling channel",
                consecutive
            );
            if let Some(channel) = channel {
                channel.close(close_code::HEARTBEAT_TIMEOUT);
            }
        }
    }
}

struct ChannelListener {
    session: Weak<SessionInner>,
    connection: u64,
}

impl ChannelObserver for ChannelListener {
    fn on_channel_event(&self, event: &ChannelEvent) {
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        let session = Weak::clone(&self.session);
        let connection = self.connection;
        let event = event.clone();
        inner.scheduler.defer(Box::new(move || {
            if let Some(inner) = session.upgrade() {
                inner.handle_channel_event(connection, event);
            }
        }));
    }
}

struct HeartbeatListener {
    session: Weak<SessionInner>,
    connection: u64,
}

impl HeartbeatObserver for HeartbeatListener {
    fn on_pong_received(&self, ping_id: u32, clock_skew_ms: i64, round_trip_ms: i64) {
        if let Some(inner) = self.session.upgrade() {
            inner.handle_pong(self.connection, ping_id, clock_skew_ms, round_trip_ms);
        }
    }

    fn on_pongs_missed(&self, consecutive: u32) {
        if let Some(inner) = self.session.upgrade() {
            inner.handle_missed_pongs(self.connection, consecutive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use std::time::Duration;
    use tether_core::ManualClock;
    use tether_transport::{MemoryConnector, PingPongFrame};

    struct Fixture {
        session: SignalingSession,
        events: SessionEvents,
        connector: Arc<MemoryConnector>,
        scheduler: ManualScheduler,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let clock = ManualClock::new(0);
        let scheduler = ManualScheduler::with_clock(clock.clone());
        let connector = Arc::new(MemoryConnector::new());
        let (tx, events) = mpsc::unbounded_channel();
        let session = SignalingSession::new(
            config,
            connector.clone(),
            Arc::new(scheduler.clone()),
            Arc::new(clock),
            tx,
        );
        Fixture {
            session,
            events,
            connector,
            scheduler,
        }
    }

    // No jitter: every retry waits exactly 100 ms.
    fn config() -> SessionConfig {
        SessionConfig::default()
            .backoff_ms(100, 0, 0)
            .ping_interval_ms(1_000)
            .missed_pongs_threshold(2)
    }

    fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn connect(f: &mut Fixture) {
        assert_eq!(f.session.start(), TransitionResult::Transitioned);
        f.connector.latest().unwrap().open();
        f.scheduler.run_deferred();
        assert_eq!(f.session.current_state(), ConnectionState::Connected);
        drain(&mut f.events);
    }

    #[test]
    fn test_start_connects_and_pings() {
        let mut f = fixture(config());
        assert_eq!(f.session.start(), TransitionResult::Transitioned);
        assert_eq!(f.session.current_state(), ConnectionState::Connecting);

        let channel = f.connector.latest().unwrap();
        channel.open();
        f.scheduler.run_deferred();

        assert_eq!(f.session.current_state(), ConnectionState::Connected);
        assert_eq!(
            drain(&mut f.events),
            vec![
                SessionEvent::Connecting { reconnecting: false },
                SessionEvent::Connected
            ]
        );
        let sent = channel.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].as_ping_pong(), Some(&PingPongFrame::ping(1)));
    }

    #[test]
    fn test_data_frames_become_messages() {
        let mut f = fixture(config());
        connect(&mut f);

        let channel = f.connector.latest().unwrap();
        channel.deliver(SignalFrame::data(&b"offer"[..]));
        f.scheduler.run_deferred();

        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::Message(Bytes::from_static(b"offer"))]
        );
        f.session.send(&b"answer"[..]).unwrap();
        assert_eq!(
            channel.sent_frames().last().map(|frame| frame.body.clone()),
            Some(SignalBody::Data(Bytes::from_static(b"answer")))
        );
    }

    #[test]
    fn test_send_without_channel_fails() {
        let f = fixture(config());
        assert!(matches!(
            f.session.send(&b"early"[..]),
            Err(TransportError::NotOpen)
        ));
    }

    #[test]
    fn test_pong_reported() {
        let mut f = fixture(config());
        connect(&mut f);

        f.scheduler.advance(Duration::from_millis(30));
        let pong = SignalFrame::ping_pong(PingPongFrame::pong(1)).with_timestamp(1_000);
        f.connector.latest().unwrap().deliver(pong);
        f.scheduler.run_deferred();

        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::PongReceived {
                ping_id: 1,
                clock_skew_ms: -985,
                round_trip_ms: 30
            }]
        );
    }

    #[test]
    fn test_stop_disconnects_without_retry() {
        let mut f = fixture(config());
        connect(&mut f);

        assert_eq!(f.session.stop(), TransitionResult::Transitioned);
        f.scheduler.run_deferred();

        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        assert_eq!(f.connector.latest().unwrap().local_close_code(), Some(1000));
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [SessionEvent::Disconnected { code: 1000, .. }]
        ));

        f.scheduler.advance(Duration::from_secs(10));
        assert_eq!(f.connector.opened_count(), 1);
    }

    #[test]
    fn test_abnormal_close_reconnects() {
        let mut f = fixture(config());
        connect(&mut f);

        f.connector.latest().unwrap().fail("connection reset");
        f.scheduler.run_deferred();
        assert_eq!(f.session.current_state(), ConnectionState::Disconnecting);
        assert!(f.session.has_pending_retry());

        f.scheduler.advance(Duration::from_millis(100));
        assert_eq!(f.session.current_state(), ConnectionState::Connecting);
        assert_eq!(f.connector.opened_count(), 2);
        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::Connecting { reconnecting: true }]
        );

        f.connector.latest().unwrap().open();
        f.scheduler.run_deferred();
        assert_eq!(f.session.current_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_terminal_close_disconnects() {
        let mut f = fixture(config());
        connect(&mut f);

        f.connector
            .latest()
            .unwrap()
            .close_from_remote(close_code::KICKED, "kicked");
        f.scheduler.run_deferred();

        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::Disconnected {
                code: 4003,
                reason: "kicked".to_string()
            }]
        );
        assert!(!f.session.has_pending_retry());
    }

    #[test]
    fn test_stop_while_waiting_for_retry() {
        let mut f = fixture(config());
        connect(&mut f);
        f.connector.latest().unwrap().fail("reset");
        f.scheduler.run_deferred();
        assert!(f.session.has_pending_retry());

        assert_eq!(f.session.stop(), TransitionResult::NoTransitionAvailable);
        f.scheduler.run_deferred();

        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [SessionEvent::Disconnected { code: 1006, .. }]
        ));
        f.scheduler.advance(Duration::from_secs(1));
        assert_eq!(f.connector.opened_count(), 1);
    }

    #[test]
    fn test_missed_pongs_close_channel() {
        let mut f = fixture(config());
        connect(&mut f);

        f.scheduler.advance(Duration::from_millis(2_000));

        let channel = f.connector.channels()[0].clone();
        assert_eq!(channel.local_close_code(), Some(close_code::HEARTBEAT_TIMEOUT));
        let events = drain(&mut f.events);
        assert_eq!(
            &events[..2],
            &[SessionEvent::PongsMissed(1), SessionEvent::PongsMissed(2)]
        );
        assert!(f.session.has_pending_retry());
    }

    #[test]
    fn test_retry_limit_reports_disconnect() {
        let mut f = fixture(config().max_reconnect_attempts(1));
        connect(&mut f);

        f.connector.latest().unwrap().fail("reset");
        f.scheduler.run_deferred();
        f.connector.refuse_next(1);
        f.scheduler.advance(Duration::from_millis(100));

        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::Disconnected {
                code: 1006,
                reason: "failed to open signaling channel".to_string()
            }]
        );
    }

    #[test]
    fn test_refused_open_is_retried() {
        let mut f = fixture(config());
        connect(&mut f);

        f.connector.latest().unwrap().fail("reset");
        f.scheduler.run_deferred();
        f.connector.refuse_next(1);
        f.scheduler.advance(Duration::from_millis(100));
        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        assert!(f.session.has_pending_retry());

        f.scheduler.advance(Duration::from_millis(100));
        assert_eq!(f.session.current_state(), ConnectionState::Connecting);
        assert_eq!(f.connector.opened_count(), 2);
    }

    #[test]
    fn test_start_while_retry_pending_connects() {
        let mut f = fixture(config());
        connect(&mut f);

        f.connector.latest().unwrap().fail("reset");
        f.scheduler.run_deferred();
        f.connector.refuse_next(1);
        f.scheduler.advance(Duration::from_millis(100));
        assert!(f.session.has_pending_retry());
        drain(&mut f.events);

        assert_eq!(f.session.start(), TransitionResult::Transitioned);
        f.scheduler.run_deferred();

        assert!(!f.session.has_pending_retry());
        assert_eq!(f.session.current_state(), ConnectionState::Connecting);
        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::Connecting { reconnecting: false }]
        );

        f.scheduler.advance(Duration::from_millis(500));
        assert_eq!(f.connector.opened_count(), 2);
        f.connector.latest().unwrap().open();
        f.scheduler.run_deferred();
        assert_eq!(f.session.current_state(), ConnectionState::Connected);
        assert_eq!(drain(&mut f.events), vec![SessionEvent::Connected]);
    }

    #[test]
    fn test_stop_while_connecting_is_deferred() {
        let mut f = fixture(config());
        assert_eq!(f.session.start(), TransitionResult::Transitioned);
        assert_eq!(f.session.stop(), TransitionResult::DeferredTransition);

        f.connector.latest().unwrap().open();
        f.scheduler.run_deferred();

        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        let events = drain(&mut f.events);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Disconnected { code: 1000, .. })
        ));
    }

    #[test]
    fn test_reconnect_replaces_channel() {
        let mut f = fixture(config());
        connect(&mut f);

        assert_eq!(f.session.reconnect(), TransitionResult::Transitioned);
        f.scheduler.run_deferred();

        let channels = f.connector.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].local_close_code(), Some(close_code::GOING_AWAY));
        assert_eq!(f.session.current_state(), ConnectionState::Connecting);
        assert_eq!(
            drain(&mut f.events),
            vec![SessionEvent::Connecting { reconnecting: true }]
        );
    }

    #[test]
    fn test_update_round_trip() {
        let mut f = fixture(config());
        connect(&mut f);

        assert_eq!(f.session.begin_update(|| Ok(())), TransitionResult::Transitioned);
        assert_eq!(f.session.current_state(), ConnectionState::Updating);
        assert_eq!(f.session.finish_update(|| Ok(())), TransitionResult::Transitioned);
        assert_eq!(f.session.current_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_reconnect_deadline_stops_retrying() {
        let mut f = fixture(config().reconnect_timeout_ms(100));
        connect(&mut f);

        f.connector.latest().unwrap().fail("reset");
        f.scheduler.run_deferred();
        f.scheduler.advance(Duration::from_millis(100));
        f.connector.latest().unwrap().fail("reset again");
        f.scheduler.run_deferred();
        drain(&mut f.events);

        f.scheduler.advance(Duration::from_millis(100));
        f.connector.latest().unwrap().fail("still failing");
        f.scheduler.run_deferred();

        assert_eq!(f.session.current_state(), ConnectionState::NotConnected);
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [
                SessionEvent::Connecting { reconnecting: true },
                SessionEvent::Disconnected { code: 1006, .. }
            ]
        ));
    }
}
