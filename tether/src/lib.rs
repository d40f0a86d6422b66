//! # Tether
//!
//! Resilient signaling sessions for Rust.
//!
//! Tether keeps a signaling channel alive: it tracks the session lifecycle
//! with a small state machine, reconnects with full jitter exponential
//! backoff inside a time budget, and watches the peer with a ping/pong
//! heartbeat that also estimates round trip time and clock skew.
//!
//! ## Features
//!
//! - **Deferred transitions** - Actions arriving mid-transition are replayed in priority order
//! - **Bounded reconnects** - Jittered backoff, optional retry limit, reconnect deadline
//! - **Heartbeat** - Missed pong detection, round trip and clock skew estimates
//! - **Pluggable transport** - TCP out of the box, in-memory channel for tests
//!
//! ## Quick Start
//!
//! ```ignore
//! use tether::prelude::*;
//!
//! let (session, mut events) = SessionBuilder::tcp(TcpChannelConfig::new(addr))
//!     .config(SessionConfig::default().ping_interval_ms(5_000))
//!     .build()?;
//!
//! session.start();
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Crate Organization
//!
//! - [`core`] - State machine, backoff, clocks, observer registry
//! - [`transport`] - Signal frames, codec, channel contract, TCP and memory channels
//! - [`client`] - Scheduler, reconnect controller, heartbeat, session

pub mod prelude;

/// Connection lifecycle types.
pub mod core {
    pub use tether_core::*;
}

/// Signaling channel layer.
pub mod transport {
    pub use tether_transport::*;
}

/// Session engine.
pub mod client {
    pub use tether_client::*;
}

pub use tether_client::{SessionBuilder, SessionConfig, SessionEvent, SignalingSession};
pub use tether_core::{ConnectionState, TransitionResult};
pub use tether_transport::{SignalFrame, SignalingChannel};
