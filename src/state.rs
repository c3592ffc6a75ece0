//! Deterministic connection state machine
//!
//! All legal transitions live in one table, [`next_state`]. The connection
//! manager fires triggers; anything not in the table is rejected.
//!
//! ## State Diagram
//!
//! ```text
//!   IDLE ──start──▶ CONNECTING ──handshake ok──▶ OPEN
//!    ▲                 │    ▲                      │ │
//!    │          handshake   │ retry timer    lost/ │ │ stop/pause
//!    │            failed    │                 hb   │ │
//!    │                 ▼    │                      ▼ ▼
//!    │             CLOSED(HandshakeFailed|Dirty) ◀─┘ CLOSING ──▶ CLOSED(Clean)
//!    │                 │                               │
//!    │          ceiling reached                        └──▶ SUSPENDED
//!    │                 ▼                                        │
//!    │           CLOSED(CeilingExceeded) ──start──▶ ...         │
//!    └──────────────────── resume (nothing to reconnect) ◀──────┘
//! ```
//!
//! `pause` reaches SUSPENDED from any state, through CLOSING when a socket exists.

use crate::data::{ClosedReason, ConnectionState};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// What triggered a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionTrigger {
    /// Application called start() or reconnect()
    Start,
    /// Transport handshake (and server ack, when awaited) succeeded
    HandshakeSucceeded,
    /// Handshake failed, timed out, or no token
    HandshakeFailed(String),
    /// Transport reported an unexpected close or error
    ConnectionLost { code: u16, reason: String },
    /// No pong inside the grace window
    HeartbeatTimeout,
    /// Backoff timer fired
    RetryTimerFired { attempt: u32 },
    /// Attempt ceiling reached
    CeilingExceeded,
    /// Application called stop()
    Stop,
    /// Visibility gate called pause()
    Pause,
    /// Socket torn down after stop()
    CloseComplete,
    /// Socket torn down after pause()
    SuspendComplete,
    /// resume(); `reconnect` says whether the manager was connected before pausing
    Resume { reconnect: bool },
}

/// State transition event
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub trigger: TransitionTrigger,
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: ConnectionState, to: ConnectionState, trigger: TransitionTrigger) -> Self {
        Self {
            from,
            to,
            trigger,
            timestamp: Instant::now(),
        }
    }
}

/// The transition table. `None` means the trigger is illegal in `state`.
pub fn next_state(state: &ConnectionState, trigger: &TransitionTrigger) -> Option<ConnectionState> {
    use ConnectionState::*;
    use TransitionTrigger as T;

    let next = match (state, trigger) {
        (Idle | Closed { .. }, T::Start) => Connecting,
        (
            Closed {
                reason: ClosedReason::Dirty | ClosedReason::HandshakeFailed,
            },
            T::RetryTimerFired { .. },
        ) => Connecting,

        (Connecting, T::HandshakeSucceeded) => Open,
        (Connecting, T::HandshakeFailed(_) | T::ConnectionLost { .. } | T::HeartbeatTimeout) => Closed {
            reason: ClosedReason::HandshakeFailed,
        },
        (Open, T::ConnectionLost { .. } | T::HeartbeatTimeout) => Closed {
            reason: ClosedReason::Dirty,
        },

        (
            Closed {
                reason: ClosedReason::Dirty | ClosedReason::HandshakeFailed,
            },
            T::CeilingExceeded,
        ) => Closed {
            reason: ClosedReason::CeilingExceeded,
        },

        (Connecting | Open, T::Stop | T::Pause) => Closing,
        (Closed { .. } | Suspended, T::Stop) => Closed {
            reason: ClosedReason::Clean,
        },
        (Closing, T::CloseComplete) => Closed {
            reason: ClosedReason::Clean,
        },
        (Idle | Closed { .. }, T::Pause) => Suspended,
        (Closing, T::SuspendComplete) => Suspended,

        (Suspended, T::Resume { reconnect: true }) => Connecting,
        (Suspended, T::Resume { reconnect: false }) => Idle,

        _ => return None,
    };
    Some(next)
}

/// Connection state machine with a bounded transition history
pub struct StateMachine {
    state: ConnectionState,
    history: VecDeque<StateTransition>,
    max_history: usize,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            history: VecDeque::new(),
            max_history: 100,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn can_fire(&self, trigger: &TransitionTrigger) -> bool {
        next_state(&self.state, trigger).is_some()
    }

    /// Apply a trigger
    pub fn fire(&mut self, trigger: TransitionTrigger) -> Result<StateTransition, StateError> {
        let to = next_state(&self.state, &trigger).ok_or_else(|| StateError::InvalidTransition {
            from: self.state.clone(),
            trigger: trigger.clone(),
        })?;

        let from = std::mem::replace(&mut self.state, to.clone());
        let transition = StateTransition::new(from, to, trigger);

        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        tracing::info!(
            from = %transition.from,
            to = %transition.to,
            trigger = ?transition.trigger,
            "State transition"
        );

        Ok(transition)
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    InvalidTransition {
        from: ConnectionState,
        trigger: TransitionTrigger,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::InvalidTransition { from, trigger } => {
                write!(f, "Invalid transition: {:?} not allowed in state {}", trigger, from)
            }
        }
    }
}

impl std::error::Error for StateError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> TransitionTrigger {
        TransitionTrigger::ConnectionLost {
            code: 1006,
            reason: "abnormal closure".to_string(),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new();
        assert_eq!(*sm.state(), ConnectionState::Idle);

        sm.fire(TransitionTrigger::Start).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Connecting);

        sm.fire(TransitionTrigger::HandshakeSucceeded).unwrap();
        assert!(sm.state().is_open());

        sm.fire(TransitionTrigger::Stop).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Closing);
        sm.fire(TransitionTrigger::CloseComplete).unwrap();
        assert_eq!(
            *sm.state(),
            ConnectionState::Closed {
                reason: ClosedReason::Clean
            }
        );
        assert_eq!(sm.history().count(), 4);
    }

    #[test]
    fn test_dirty_close_and_retry() {
        let mut sm = StateMachine::new();
        sm.fire(TransitionTrigger::Start).unwrap();
        sm.fire(TransitionTrigger::HandshakeSucceeded).unwrap();
        sm.fire(lost()).unwrap();
        assert!(matches!(
            *sm.state(),
            ConnectionState::Closed {
                reason: ClosedReason::Dirty
            }
        ));

        sm.fire(TransitionTrigger::RetryTimerFired { attempt: 1 }).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Connecting);
        sm.fire(TransitionTrigger::HandshakeFailed("refused".to_string())).unwrap();
        sm.fire(TransitionTrigger::CeilingExceeded).unwrap();
        assert!(sm.state().is_terminal());

        // terminal: no more timer retries, only an explicit start
        assert!(!sm.can_fire(&TransitionTrigger::RetryTimerFired { attempt: 6 }));
        sm.fire(TransitionTrigger::Start).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_clean_close_never_retries() {
        let mut sm = StateMachine::new();
        sm.fire(TransitionTrigger::Start).unwrap();
        sm.fire(TransitionTrigger::Stop).unwrap();
        sm.fire(TransitionTrigger::CloseComplete).unwrap();

        assert!(sm.fire(TransitionTrigger::RetryTimerFired { attempt: 1 }).is_err());
    }

    #[test]
    fn test_pause_from_any_state() {
        let mut sm = StateMachine::new();
        sm.fire(TransitionTrigger::Pause).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Suspended);
        sm.fire(TransitionTrigger::Resume { reconnect: false }).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Idle);

        sm.fire(TransitionTrigger::Start).unwrap();
        sm.fire(TransitionTrigger::HandshakeSucceeded).unwrap();
        sm.fire(TransitionTrigger::Pause).unwrap();
        sm.fire(TransitionTrigger::SuspendComplete).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Suspended);
        sm.fire(TransitionTrigger::Resume { reconnect: true }).unwrap();
        assert_eq!(*sm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = StateMachine::new();
        assert!(sm.fire(TransitionTrigger::HandshakeSucceeded).is_err());
        assert!(sm.fire(TransitionTrigger::Resume { reconnect: true }).is_err());

        sm.fire(TransitionTrigger::Start).unwrap();
        // start while connecting is not a transition
        assert!(sm.fire(TransitionTrigger::Start).is_err());
        assert_eq!(*sm.state(), ConnectionState::Connecting);
    }
}
