//! Signal frames exchanged over a signaling channel.

use bytes::Bytes;

/// Direction of a ping/pong control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PingPongKind {
    /// Request for a reply.
    Ping,
    /// Reply echoing the ping id.
    Pong,
}

/// Heartbeat control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PingPongFrame {
    /// Ping or pong.
    pub kind: PingPongKind,
    /// Opaque identifier echoed by the pong.
    pub ping_id: u32,
}

impl PingPongFrame {
    /// Creates a ping.
    #[must_use]
    pub fn ping(ping_id: u32) -> Self {
        Self {
            kind: PingPongKind::Ping,
            ping_id,
        }
    }

    /// Creates a pong.
    #[must_use]
    pub fn pong(ping_id: u32) -> Self {
        Self {
            kind: PingPongKind::Pong,
            ping_id,
        }
    }
}

/// Payload of a signal frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    /// Heartbeat control.
    PingPong(PingPongFrame),
    /// Opaque application data.
    Data(Bytes),
}

/// A frame on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFrame {
    /// Sender's wall clock in milliseconds since the Unix epoch, if stamped.
    pub timestamp_ms: Option<i64>,
    /// Frame payload.
    pub body: SignalBody,
}

impl SignalFrame {
    /// Creates an unstamped ping/pong frame.
    #[must_use]
    pub fn ping_pong(frame: PingPongFrame) -> Self {
        Self {
            timestamp_ms: None,
            body: SignalBody::PingPong(frame),
        }
    }

    /// Creates an unstamped data frame.
    #[must_use]
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp_ms: None,
            body: SignalBody::Data(payload.into()),
        }
    }

    /// Stamps the frame with the sender's clock.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Returns the ping/pong payload, if this is a control frame.
    #[must_use]
    pub fn as_ping_pong(&self) -> Option<&PingPongFrame> {
        match &self.body {
            SignalBody::PingPong(frame) => Some(frame),
            SignalBody::Data(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_constructors() {
        let ping = PingPongFrame::ping(7);
        assert_eq!(ping.kind, PingPongKind::Ping);
        assert_eq!(PingPongFrame::pong(7).ping_id, ping.ping_id);
    }

    #[test]
    fn test_signal_frame_accessors() {
        let frame = SignalFrame::ping_pong(PingPongFrame::pong(3)).with_timestamp(42);
        assert_eq!(frame.timestamp_ms, Some(42));
        assert_eq!(frame.as_ping_pong(), Some(&PingPongFrame::pong(3)));

        let data = SignalFrame::data(&b"hello"[..]);
        assert!(data.as_ping_pong().is_none());
        assert_eq!(data.timestamp_ms, None);
    }
}
