//! Debounce guard for public lifecycle calls
//!
//! Each operation kind may run at most once per window. Calls landing inside
//! the window are dropped, not queued.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Kinds of rate-limited operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// `start()` and `resume()`
    Connect,
    /// `pause()`
    Pause,
    /// `reconnect()`
    Reconnect,
}

/// Per-kind debounce guard
pub struct ActionGuard {
    window: Duration,
    last_allowed: Mutex<HashMap<ActionKind, Instant>>,
}

impl ActionGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records the call when it is outside the window
    pub fn try_acquire(&self, kind: ActionKind) -> bool {
        if self.window.is_zero() {
            return true;
        }

        let now = Instant::now();
        let mut last = self.last_allowed.lock().unwrap_or_else(PoisonError::into_inner);
        match last.get(&kind) {
            Some(previous) if now.duration_since(*previous) < self.window => {
                tracing::debug!(?kind, window = ?self.window, "Dropping debounced call");
                false
            }
            _ => {
                last.insert(kind, now);
                true
            }
        }
    }

    /// Time left before `kind` is allowed again
    pub fn remaining(&self, kind: ActionKind) -> Duration {
        let last = self.last_allowed.lock().unwrap_or_else(PoisonError::into_inner);
        last.get(&kind)
            .map(|previous| self.window.saturating_sub(previous.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
