//! Prelude module for convenient imports.
//!
//! ```ignore
//! use tether::prelude::*;
//! ```

// Core types
pub use tether_core::error::{Error as CoreError, Result as CoreResult};
pub use tether_core::{
    Backoff, BackoffError, Clock, ConnectionState, FullJitterBackoff, FullJitterLimitedBackoff,
    ManualClock, SystemClock, TransitionResult,
};

// Transport types
pub use tether_transport::{
    ChannelEvent, ChannelObserver, Connector, MemoryConnector, PingPongFrame, PingPongKind,
    SignalBody, SignalFrame, SignalingChannel, TransportError, close_code,
};
pub use tether_transport::{ControlFrameCodec, TcpChannelConfig, TcpConnector};

// Client types
pub use tether_client::{
    ClientError, HeartbeatObserver, ManualScheduler, Scheduler, SessionBuilder, SessionConfig,
    SessionEvent, SessionEvents, SignalingSession, TokioScheduler,
};
