//! Session builder.

use crate::config::SessionConfig;
use crate::error::ClientError;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::session::{SessionEvents, SignalingSession};
use std::sync::Arc;
use tether_core::{Clock, SystemClock};
use tether_transport::Connector;
use tokio::sync::mpsc;

/// Builder for configuring and creating a session.
pub struct SessionBuilder {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionBuilder {
    /// Creates a builder opening channels through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config: SessionConfig::default(),
            scheduler: None,
            clock: None,
        }
    }

    /// Creates a builder for a TCP signaling server.
    #[cfg(feature = "tcp-tokio")]
    #[must_use]
    pub fn tcp(config: tether_transport::TcpChannelConfig) -> Self {
        Self::new(Arc::new(tether_transport::TcpConnector::new(config)))
    }

    /// Sets the session configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the scheduler. Defaults to a [`TokioScheduler`] on the current runtime.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the clock. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the session and the receiver of its events.
    ///
    /// # Errors
    /// Returns `ClientError::InvalidConfig` for a rejected configuration, or
    /// `ClientError::NoRuntime` when no scheduler was given and there is no
    /// tokio runtime to create one on.
    pub fn build(self) -> Result<(SignalingSession, SessionEvents), ClientError> {
        self.config.validate()?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::debug!("building signaling session with {:?}", self.config);
        let session = SignalingSession::new(self.config, self.connector, scheduler, clock, tx);
        Ok((session, rx))
    }
}
