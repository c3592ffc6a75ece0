//! Host visibility adapter

use crate::{
    client::StreamClient,
    data::{ClosedReason, ConnectionState},
};
use std::sync::{Mutex, PoisonError};

/// What a visibility change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityAction {
    Paused,
    Resumed,
    Reconnected,
    /// Same visibility as before, or nothing to do in the current state
    Ignored,
    /// The client dropped the call (debounced or gone)
    Dropped,
}

/// Pauses a client while its host is hidden and brings it back when shown
pub struct VisibilityGate {
    client: StreamClient,
    last: Mutex<Option<bool>>,
}

impl VisibilityGate {
    pub fn new(client: StreamClient) -> Self {
        Self {
            client,
            last: Mutex::new(None),
        }
    }

    /// A `Dropped` call leaves the recorded visibility unchanged so the
    /// caller can repeat it.
    pub fn set_visible(&self, visible: bool) -> VisibilityAction {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == Some(visible) {
            return VisibilityAction::Ignored;
        }

        let action = self.apply(visible);
        if action != VisibilityAction::Dropped {
            *last = Some(visible);
        }
        action
    }

    fn apply(&self, visible: bool) -> VisibilityAction {
        if !visible {
            tracing::debug!("Host hidden; pausing stream");
            return accepted(self.client.pause(), VisibilityAction::Paused);
        }

        match self.client.get_state() {
            ConnectionState::Suspended => {
                tracing::debug!("Host visible; resuming stream");
                accepted(self.client.resume(), VisibilityAction::Resumed)
            }
            // an application stop() is not undone by visibility
            ConnectionState::Closed { reason } if reason != ClosedReason::Clean => {
                tracing::info!(?reason, "Host visible while closed; reconnecting");
                accepted(self.client.reconnect(), VisibilityAction::Reconnected)
            }
            _ => VisibilityAction::Ignored,
        }
    }

    pub fn client(&self) -> &StreamClient {
        &self.client
    }
}

fn accepted(issued: bool, action: VisibilityAction) -> VisibilityAction {
    if issued {
        action
    } else {
        VisibilityAction::Dropped
    }
}
