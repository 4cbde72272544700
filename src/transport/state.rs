//! Connection state machine.

use serde::Serialize;
use std::fmt;
use tokio::sync::{mpsc, watch};

/// Lifecycle of the realtime link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Reconnecting,
    Error,
    Closed,
}

impl ConnectionState {
    /// A peer link is up.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Listening | ConnectionState::Speaking
        )
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle | Closed, Connecting) => true,
            (Idle | Error, Closed) => true,
            (Connecting, Connected | Closed) => true,
            (Connected, Listening | Speaking | Closed) => true,
            (Listening, Connected | Speaking | Closed) => true,
            (Speaking, Connected | Closed) => true,
            (Connected | Listening | Speaking, Reconnecting) => true,
            (Reconnecting, Connected | Closed) => true,
            (Error, Connecting) => false,
            (from, Error) => from != Error,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Listening => "listening",
            ConnectionState::Speaking => "speaking",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Single authoritative connection state.
///
/// The latest value is published on a watch channel; every applied
/// transition is also recorded in order on an optional history channel.
pub struct StateMachine {
    current: watch::Sender<ConnectionState>,
    history: Option<mpsc::UnboundedSender<ConnectionState>>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Idle);
        Self {
            current,
            history: None,
        }
    }

    /// Record every applied transition, in order.
    pub fn with_history(mut self, history: mpsc::UnboundedSender<ConnectionState>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn current(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    /// Apply a transition. Rejected transitions leave the state unchanged.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let from = self.current();
        if from == next {
            return false;
        }
        if !from.can_transition_to(next) {
            tracing::debug!(from = %from, to = %next, "Rejected state transition");
            return false;
        }
        self.current.send_replace(next);
        if let Some(history) = &self.history
            && history.send(next).is_err()
        {
            tracing::trace!("State history receiver dropped");
        }
        tracing::debug!(from = %from, to = %next, "Connection state");
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
