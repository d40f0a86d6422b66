//! # Tether Core
//!
//! Core connection lifecycle types for resilient signaling sessions.
//!
//! This crate provides:
//! - Session state machine with deferred, prioritised transitions
//! - Full jitter exponential backoff (unlimited and limited)
//! - Wall clock abstraction with a manually driven test clock
//! - Shared observer registry used for event fan-out
//! - Error types for backoff and state operations

pub mod backoff;
pub mod clock;
pub mod error;
pub mod observer;
pub mod state;

pub use backoff::{Backoff, FullJitterBackoff, FullJitterLimitedBackoff};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackoffError, Error, Result};
pub use observer::{ObserverId, ObserverSet};
pub use state::{
    Action, ConnectionState, DeferPriority, SessionStateController, TransitionResult, Work,
};
