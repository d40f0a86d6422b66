//! # Tether Transport
//!
//! Signaling channel layer for tether sessions.
//!
//! This crate provides:
//! - [`frame`] - Signal frames carrying ping/pong control or application data
//! - [`codec`] - Length-prefixed framing codec for stream transports
//! - [`channel`] - The channel contract observed by heartbeats and sessions
//! - [`memory`] - In-process channel for embedding and tests
//! - [`tcp`] - TCP channel built on tokio

pub mod channel;
#[cfg(feature = "tcp-tokio")]
pub mod codec;
pub mod error;
pub mod frame;
pub mod memory;
#[cfg(feature = "tcp-tokio")]
pub mod tcp;

pub use channel::{
    ChannelEvent, ChannelObserver, Connector, SignalingChannel, close_code,
    is_reconnectable_close,
};
#[cfg(feature = "tcp-tokio")]
pub use codec::ControlFrameCodec;
pub use error::TransportError;
pub use frame::{PingPongFrame, PingPongKind, SignalBody, SignalFrame};
pub use memory::{MemoryChannel, MemoryConnector};
#[cfg(feature = "tcp-tokio")]
pub use tcp::{TcpChannelConfig, TcpConnector, TcpSignalingChannel};
pub use tether_core::ObserverId;
