//! # Tether Client
//!
//! Connection resilience for signaling sessions.
//!
//! This crate provides:
//! - Scheduler abstraction with a tokio implementation and a manual one for tests
//! - Reconnect controller with deadlines and jittered backoff
//! - Ping/pong heartbeat with round trip and clock skew estimates
//! - Signaling session tying the state machine, heartbeat and reconnects together

pub mod builder;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod scheduler;
pub mod session;

pub use builder::SessionBuilder;
pub use config::SessionConfig;
pub use error::ClientError;
pub use heartbeat::{Heartbeat, HeartbeatObserver};
pub use reconnect::ReconnectController;
pub use scheduler::{ManualScheduler, RepeatingTask, Scheduler, Task, TimerHandle, TokioScheduler};
pub use session::{SessionEvent, SessionEvents, SignalingSession};
