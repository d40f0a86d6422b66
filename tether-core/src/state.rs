//! Session state machine.
//!
//! [`SessionStateController`] linearizes connect/update/disconnect/fail
//! requests into a single sequence of transitions. Requests that arrive while
//! a connect or update is still in flight are deferred, and only the most
//! urgent deferred request is kept.

use std::fmt;

/// Connection state held by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    NotConnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected and idle.
    Connected,
    /// Connected, with an update in progress.
    Updating,
    /// Tearing down the connection.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Start connecting.
    Connect,
    /// The connection attempt succeeded.
    FinishConnecting,
    /// Start an update of a live connection.
    Update,
    /// The update completed.
    FinishUpdating,
    /// Tear down and reconnect a live connection.
    Reconnect,
    /// Disconnect on request.
    Disconnect,
    /// The connection failed.
    Fail,
    /// Teardown completed.
    FinishDisconnecting,
}

impl Action {
    /// Returns the priority this action has when it must be deferred.
    #[must_use]
    pub fn defer_priority(self) -> DeferPriority {
        match self {
            Action::Disconnect => DeferPriority::VeryHigh,
            Action::Fail => DeferPriority::High,
            Action::Reconnect => DeferPriority::Medium,
            Action::Update => DeferPriority::Low,
            Action::Connect
            | Action::FinishConnecting
            | Action::FinishUpdating
            | Action::FinishDisconnecting => DeferPriority::DoNotDefer,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Priority of a deferred action, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeferPriority {
    /// The action is never deferred.
    DoNotDefer,
    /// Low priority.
    Low,
    /// Medium priority.
    Medium,
    /// High priority.
    High,
    /// Highest priority.
    VeryHigh,
}

/// Outcome of [`SessionStateController::perform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum TransitionResult {
    /// The transition happened and its work ran.
    Transitioned,
    /// No transition exists for the action in the current state.
    NoTransitionAvailable,
    /// The action was stored to be replayed after the next transition.
    DeferredTransition,
    /// The work failed and the state was rolled back.
    TransitionFailed,
}

/// Work attached to a transition, stored while the action is deferred.
pub type Work = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct DeferredAction {
    action: Action,
    work: Work,
}

/// Serializes session state transitions.
#[derive(Default)]
pub struct SessionStateController {
    state: ConnectionState,
    deferred: Option<DeferredAction>,
}

impl SessionStateController {
    /// Creates a controller in the `NotConnected` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the action currently waiting to be replayed, if any.
    #[must_use]
    pub fn deferred_action(&self) -> Option<Action> {
        self.deferred.as_ref().map(|deferred| deferred.action)
    }

    /// Attempts the transition for `action` and runs `work` if it happens.
    ///
    /// `work` runs after the state has moved. If it fails the state is rolled
    /// back and `TransitionFailed` is returned. After a successful transition
    /// any deferred action is replayed; the replay outcome does not change
    /// the result of this call.
    pub fn perform<F>(&mut self, action: Action, work: F) -> TransitionResult
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let previous = self.state;
        let Some(next) = Self::next_state(previous, action) else {
            if self.can_defer(action) {
                tracing::info!("deferring transition from {} with {}", self.state, action);
                self.defer(action, Box::new(work));
                return TransitionResult::DeferredTransition;
            }
            tracing::warn!("no transition found from {} with {}", self.state, action);
            return TransitionResult::NoTransitionAvailable;
        };

        tracing::info!("transitioning from {} to {} with {}", previous, next, action);
        self.state = next;

        if let Err(e) = work() {
            tracing::error!(
                "error during state {} with action {}: {:#}",
                self.state,
                action,
                e
            );
            tracing::info!("rolling back transition to {}", previous);
            self.state = previous;
            return TransitionResult::TransitionFailed;
        }

        self.perform_deferred_action();
        TransitionResult::Transitioned
    }

    fn next_state(state: ConnectionState, action: Action) -> Option<ConnectionState> {
        use Action as A;
        use ConnectionState as S;

        match (state, action) {
            (S::NotConnected, A::Connect) => Some(S::Connecting),
            (S::Connecting, A::Fail) => Some(S::Disconnecting),
            (S::Connecting, A::FinishConnecting) => Some(S::Connected),
            (S::Connected, A::Disconnect) => Some(S::Disconnecting),
            (S::Connected, A::Reconnect) => Some(S::Connecting),
            (S::Connected, A::Fail) => Some(S::Disconnecting),
            (S::Connected, A::Update) => Some(S::Updating),
            (S::Updating, A::Fail) => Some(S::Disconnecting),
            (S::Updating, A::FinishUpdating) => Some(S::Connected),
            (S::Disconnecting, A::FinishDisconnecting) => Some(S::NotConnected),
            _ => None,
        }
    }

    fn can_defer(&self, action: Action) -> bool {
        action.defer_priority() != DeferPriority::DoNotDefer
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Updating
            )
    }

    fn defer(&mut self, action: Action, work: Work) {
        if let Some(existing) = &self.deferred {
            if existing.action.defer_priority() > action.defer_priority() {
                tracing::info!(
                    "dropping deferred {} in favor of pending {}",
                    action,
                    existing.action
                );
                return;
            }
        }
        self.deferred = Some(DeferredAction { action, work });
    }

    fn perform_deferred_action(&mut self) {
        let Some(DeferredAction { action, work }) = self.deferred.take() else {
            return;
        };
        tracing::info!("performing deferred action {}", action);
        if self.perform(action, work) != TransitionResult::Transitioned {
            tracing::info!(
                "unable to perform deferred action {} in state {}",
                action,
                self.state
            );
        }
    }
}

impl fmt::Debug for SessionStateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStateController")
            .field("state", &self.state)
            .field("deferred", &self.deferred_action())
            .finish()
    }
}
