//! Signaling channel contract.
//!
//! A channel is created by a [`Connector`] and reports its lifecycle through
//! ordered [`ChannelEvent`]s: `Opened`, any number of `FrameReceived`, then
//! `Closing`/`Errored` and finally `Closed`.

use crate::error::TransportError;
use crate::frame::SignalFrame;
use std::sync::Arc;
use tether_core::ObserverId;

/// Close codes used by tether channels (WebSocket numbering).
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Connection dropped without a close handshake.
    pub const ABNORMAL: u16 = 1006;
    /// Server hit an unexpected condition.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// The heartbeat stopped getting replies.
    pub const HEARTBEAT_TIMEOUT: u16 = 4001;
    /// Server rejected the session.
    pub const REJECTED: u16 = 4002;
    /// Session was taken over by another client.
    pub const KICKED: u16 = 4003;
    /// Authorization failed.
    pub const UNAUTHORIZED: u16 = 4401;
}

/// Returns true if a channel closed with `code` may be reconnected.
#[must_use]
pub fn is_reconnectable_close(code: u16) -> bool {
    matches!(code, close_code::GOING_AWAY | close_code::ABNORMAL | 1011..=1014)
        || (code > 4000
            && code != close_code::REJECTED
            && code != close_code::KICKED
            && code != close_code::UNAUTHORIZED)
}

/// Lifecycle and inbound traffic of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open and ready to send.
    Opened,
    /// A frame arrived.
    FrameReceived(SignalFrame),
    /// A local close is in progress.
    Closing,
    /// The channel is closed.
    Closed {
        /// Close code.
        code: u16,
        /// Human readable reason.
        reason: String,
    },
    /// The channel hit an error. A `Closed` event follows.
    Errored {
        /// Error message.
        message: String,
    },
}

/// Receives channel events in order.
pub trait ChannelObserver: Send + Sync {
    /// Called for every event on the channel.
    fn on_channel_event(&self, event: &ChannelEvent);
}

/// Bidirectional signaling channel.
pub trait SignalingChannel: Send + Sync {
    /// Returns true if the channel is open.
    fn is_ready(&self) -> bool;

    /// Sends a frame.
    ///
    /// # Errors
    /// Returns `TransportError::NotOpen` if the channel is not open.
    fn send(&self, frame: SignalFrame) -> Result<(), TransportError>;

    /// Starts closing the channel with the given code.
    fn close(&self, code: u16);

    /// Registers an observer for channel events.
    fn register_observer(&self, observer: Arc<dyn ChannelObserver>) -> ObserverId;

    /// Removes an observer registered earlier.
    fn remove_observer(&self, id: ObserverId);
}

/// Creates channels. Events of the new channel are delivered later.
pub trait Connector: Send + Sync {
    /// Creates a new channel with `observer` already registered and starts
    /// opening it.
    ///
    /// # Errors
    /// Returns `TransportError` if the channel cannot be created at all.
    fn open(
        &self,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<(Arc<dyn SignalingChannel>, ObserverId), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnectable_close_codes() {
        for code in [1001, 1006, 1011, 1012, 1013, 1014, 4001, 4004, 4500] {
            assert!(is_reconnectable_close(code), "{code}");
        }
    }

    #[test]
    fn test_terminal_close_codes() {
        for code in [1000, 1002, 1008, 1015, 4000, 4002, 4003, 4401] {
            assert!(!is_reconnectable_close(code), "{code}");
        }
    }

    #[test]
    fn test_heartbeat_timeout_is_reconnectable() {
        assert!(is_reconnectable_close(close_code::HEARTBEAT_TIMEOUT));
        assert!(!is_reconnectable_close(close_code::NORMAL));
    }
}
