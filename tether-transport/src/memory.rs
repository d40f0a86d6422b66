//! In-process signaling channel.
//!
//! [`MemoryChannel`] never opens on its own: the embedding code (or a test)
//! drives the remote side with [`open`](MemoryChannel::open),
//! [`deliver`](MemoryChannel::deliver),
//! [`close_from_remote`](MemoryChannel::close_from_remote) and
//! [`fail`](MemoryChannel::fail). Frames sent by the local side are recorded.

use crate::channel::{ChannelEvent, ChannelObserver, Connector, SignalingChannel, close_code};
use crate::error::TransportError;
use crate::frame::SignalFrame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tether_core::{ObserverId, ObserverSet};

/// Channel whose remote side is driven in-process.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    ready: AtomicBool,
    closed: AtomicBool,
    observers: ObserverSet<dyn ChannelObserver>,
    sent: Mutex<Vec<SignalFrame>>,
    local_close_code: Mutex<Option<u16>>,
}

impl MemoryChannel {
    /// Creates a channel that is not yet open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the channel and notifies observers.
    pub fn open(&self) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!("ignoring open of a closed memory channel");
            return;
        }
        self.ready.store(true, Ordering::SeqCst);
        self.emit(&ChannelEvent::Opened);
    }

    /// Delivers a frame from the remote side. Returns false if the channel is not open.
    pub fn deliver(&self, frame: SignalFrame) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.emit(&ChannelEvent::FrameReceived(frame));
        true
    }

    /// Closes the channel from the remote side.
    pub fn close_from_remote(&self, code: u16, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        self.emit(&ChannelEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Fails the channel: emits `Errored` followed by an abnormal `Closed`.
    pub fn fail(&self, message: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = message.into();
        self.ready.store(false, Ordering::SeqCst);
        self.emit(&ChannelEvent::Errored {
            message: message.clone(),
        });
        self.emit(&ChannelEvent::Closed {
            code: close_code::ABNORMAL,
            reason: message,
        });
    }

    /// Returns every frame sent by the local side.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<SignalFrame> {
        self.sent.lock().clone()
    }

    /// Removes and returns the frames sent so far.
    pub fn take_sent(&self) -> Vec<SignalFrame> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Returns the code passed to [`SignalingChannel::close`], if it was called.
    #[must_use]
    pub fn local_close_code(&self) -> Option<u16> {
        *self.local_close_code.lock()
    }

    /// Returns true once the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn emit(&self, event: &ChannelEvent) {
        for (_, observer) in self.observers.snapshot() {
            observer.on_channel_event(event);
        }
    }
}

impl SignalingChannel for MemoryChannel {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, frame: SignalFrame) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self, code: u16) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.local_close_code.lock() = Some(code);
        self.ready.store(false, Ordering::SeqCst);
        self.emit(&ChannelEvent::Closing);
        self.emit(&ChannelEvent::Closed {
            code,
            reason: "closed locally".to_string(),
        });
    }

    fn register_observer(&self, observer: Arc<dyn ChannelObserver>) -> ObserverId {
        self.observers.insert(observer)
    }

    fn remove_observer(&self, id: ObserverId) {
        self.observers.remove(id);
    }
}

/// Connector handing out a fresh [`MemoryChannel`] per `open()`.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    refusals: AtomicUsize,
}

impl MemoryConnector {
    /// Creates a connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `open()` fail.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Returns every channel created so far, oldest first.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.channels.lock().clone()
    }

    /// Returns the most recently created channel.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<MemoryChannel>> {
        self.channels.lock().last().cloned()
    }

    /// Returns the number of channels created.
    #[must_use]
    pub fn opened_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Connector for MemoryConnector {
    fn open(
        &self,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<(Arc<dyn SignalingChannel>, ObserverId), TransportError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::channel("connection refused"));
        }
        let channel = Arc::new(MemoryChannel::new());
        let id = channel.register_observer(observer);
        self.channels.lock().push(Arc::clone(&channel));
        Ok((channel, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PingPongFrame;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChannelEvent>>,
    }

    impl ChannelObserver for Recorder {
        fn on_channel_event(&self, event: &ChannelEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn test_lifecycle_events_in_order() {
        let channel = MemoryChannel::new();
        let recorder = Arc::new(Recorder::default());
        channel.register_observer(recorder.clone());

        channel.open();
        assert!(channel.deliver(SignalFrame::data(&b"hi"[..])));
        channel.close(close_code::NORMAL);

        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ChannelEvent::Opened);
        assert!(matches!(events[1], ChannelEvent::FrameReceived(_)));
        assert_eq!(events[2], ChannelEvent::Closing);
        assert!(matches!(events[3], ChannelEvent::Closed { code: 1000, .. }));
        assert_eq!(channel.local_close_code(), Some(1000));
    }

    #[test]
    fn test_send_requires_open() {
        let channel = MemoryChannel::new();
        let frame = SignalFrame::ping_pong(PingPongFrame::ping(1));

        assert!(matches!(
            channel.send(frame.clone()),
            Err(TransportError::NotOpen)
        ));
        channel.open();
        channel.send(frame.clone()).unwrap();
        assert_eq!(channel.take_sent(), vec![frame]);
        assert!(channel.sent_frames().is_empty());
    }

    #[test]
    fn test_fail_emits_error_then_close() {
        let channel = MemoryChannel::new();
        let recorder = Arc::new(Recorder::default());
        channel.register_observer(recorder.clone());
        channel.open();

        channel.fail("reset by peer");
        channel.fail("again");

        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], ChannelEvent::Errored { .. }));
        assert!(matches!(events[2], ChannelEvent::Closed { code: 1006, .. }));
        assert!(!channel.is_ready());
        assert!(!channel.deliver(SignalFrame::data(&b"late"[..])));
    }

    #[test]
    fn test_removed_observer_not_notified() {
        let channel = MemoryChannel::new();
        let recorder = Arc::new(Recorder::default());
        let id = channel.register_observer(recorder.clone());
        channel.remove_observer(id);

        channel.open();
        assert!(recorder.events.lock().is_empty());
        assert_eq!(channel.observer_count(), 0);
    }

    #[test]
    fn test_connector_creates_channels() {
        let connector = MemoryConnector::new();
        let recorder = Arc::new(Recorder::default());
        connector.refuse_next(1);

        assert!(connector.open(recorder.clone()).is_err());
        let (channel, _) = connector.open(recorder.clone()).unwrap();
        assert!(!channel.is_ready());
        assert_eq!(connector.opened_count(), 1);

        connector.latest().unwrap().open();
        assert!(channel.is_ready());
        assert_eq!(recorder.events.lock().clone(), vec![ChannelEvent::Opened]);
    }
}
