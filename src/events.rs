//! Observer registry and generation-gated delivery

use crate::{
    data::{ConnectionState, InboundEvent, Topic},
    error::SdkError,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// Callback for data events on a topic
pub type EventCallback = std::sync::Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Callback for connection state changes
pub type StateCallback = std::sync::Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// Callback for errors surfaced to the application
pub type ErrorCallback = std::sync::Arc<dyn Fn(&SdkError) + Send + Sync>;

/// Handle returned by every registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

thread_local! {
    static IN_DELIVERY: Cell<bool> = Cell::new(false);
}

/// Result of a single gated delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The generation moved on; callback was not invoked
    Stale,
    Panicked,
}

/// Generation counter guarding observer callbacks.
///
/// `advance()` returns only once no callback of an older generation is
/// running on another thread, so after it returns no stale callback can start
/// or still be in progress. Called from inside a callback it skips the wait
/// (the remaining callbacks of that dispatch still see the new generation).
///
/// `hold()` advances and additionally blocks every delivery until the
/// matching `release()`. Handles use it for stop/pause so that a connection
/// opened by a command queued earlier cannot deliver before the stop lands.
#[derive(Debug, Default)]
pub struct DeliveryGate {
    generation: AtomicU64,
    holds: AtomicU64,
    in_flight: RwLock<()>,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    /// Invalidate every outstanding generation and return the new one
    pub fn advance(&self) -> u64 {
        if IN_DELIVERY.with(Cell::get) {
            return self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        }
        let _exclusive = self.in_flight.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advance and suspend all deliveries until `release()`
    pub fn hold(&self) -> u64 {
        self.holds.fetch_add(1, Ordering::SeqCst);
        self.advance()
    }

    pub fn release(&self) {
        let _ = self
            .holds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |holds| holds.checked_sub(1));
    }

    pub fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }

    /// Run `callback` only if `generation` is still current and nothing holds the gate
    pub fn deliver<F: FnOnce()>(&self, generation: u64, callback: F) -> Delivery {
        let _shared = self.in_flight.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(generation) || self.is_held() {
            return Delivery::Stale;
        }

        let previous = IN_DELIVERY.with(|flag| flag.replace(true));
        let result = catch_unwind(AssertUnwindSafe(callback));
        IN_DELIVERY.with(|flag| flag.set(previous));

        match result {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Panicked,
        }
    }
}

struct Entry<C> {
    id: ObserverId,
    callback: C,
}

/// Event dispatcher for topic observers and lifecycle listeners
pub struct EventDispatcher {
    gate: DeliveryGate,
    topic_observers: Mutex<HashMap<Topic, Vec<Entry<EventCallback>>>>,
    any_observers: Mutex<Vec<Entry<EventCallback>>>,
    state_listeners: Mutex<Vec<Entry<StateCallback>>>,
    error_listeners: Mutex<Vec<Entry<ErrorCallback>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            gate: DeliveryGate::new(),
            topic_observers: Mutex::new(HashMap::new()),
            any_observers: Mutex::new(Vec::new()),
            state_listeners: Mutex::new(Vec::new()),
            error_listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn gate(&self) -> &DeliveryGate {
        &self.gate
    }

    /// Register an observer for one topic. Multiple observers per topic are allowed.
    pub fn register_topic(&self, topic: Topic, callback: EventCallback) -> ObserverId {
        let id = self.next_observer_id();
        tracing::debug!(?id, %topic, "Registered topic observer");
        let mut observers = self.topic_observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.entry(topic).or_default().push(Entry { id, callback });
        id
    }

    /// Register an observer for every topic
    pub fn register_any(&self, callback: EventCallback) -> ObserverId {
        let id = self.next_observer_id();
        let mut observers = self.any_observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.push(Entry { id, callback });
        id
    }

    pub fn register_state_listener(&self, callback: StateCallback) -> ObserverId {
        let id = self.next_observer_id();
        let mut listeners = self.state_listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.push(Entry { id, callback });
        id
    }

    pub fn register_error_listener(&self, callback: ErrorCallback) -> ObserverId {
        let id = self.next_observer_id();
        let mut listeners = self.error_listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.push(Entry { id, callback });
        id
    }

    /// Unregister any kind of observer by id
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut removed = false;
        {
            let mut observers = self.topic_observers.lock().unwrap_or_else(PoisonError::into_inner);
            for entries in observers.values_mut() {
                let before = entries.len();
                entries.retain(|entry| entry.id != id);
                removed |= entries.len() < before;
            }
            observers.retain(|_, entries| !entries.is_empty());
        }
        removed |= retain_except(&self.any_observers, id);
        removed |= retain_except(&self.state_listeners, id);
        removed |= retain_except(&self.error_listeners, id);

        if removed {
            tracing::debug!(?id, "Unregistered observer");
        }
        removed
    }

    pub fn observer_count(&self, topic: &str) -> usize {
        let observers = self.topic_observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Deliver an event to its topic observers, then to catch-all observers.
    ///
    /// Returns the number of callbacks that ran.
    pub fn dispatch_event(&self, generation: u64, event: &InboundEvent) -> usize {
        // snapshot so callbacks can register or unregister without deadlocking
        let callbacks: Vec<(ObserverId, EventCallback)> = {
            let topic_observers = self.topic_observers.lock().unwrap_or_else(PoisonError::into_inner);
            let any_observers = self.any_observers.lock().unwrap_or_else(PoisonError::into_inner);
            topic_observers
                .get(&event.topic)
                .into_iter()
                .flatten()
                .chain(any_observers.iter())
                .map(|entry| (entry.id, entry.callback.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match self.gate.deliver(generation, || callback(event)) {
                Delivery::Delivered => delivered += 1,
                Delivery::Stale => break,
                Delivery::Panicked => {
                    let message = format!("Observer {:?} panicked while handling {}", id, event.topic);
                    tracing::error!("{}", message);
                    self.dispatch_error(&SdkError::Observer(message));
                }
            }
        }
        delivered
    }

    /// Notify state listeners. Not generation-gated: closing transitions are still reported.
    pub fn dispatch_state_change(&self, state: &ConnectionState) {
        let callbacks: Vec<(ObserverId, StateCallback)> = {
            let listeners = self.state_listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.iter().map(|e| (e.id, e.callback.clone())).collect()
        };

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                let message = format!("State listener {:?} panicked", id);
                tracing::error!("{}", message);
                self.dispatch_error(&SdkError::Observer(message));
            }
        }
    }

    /// Notify error listeners
    pub fn dispatch_error(&self, error: &SdkError) {
        let callbacks: Vec<(ObserverId, ErrorCallback)> = {
            let listeners = self.error_listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.iter().map(|e| (e.id, e.callback.clone())).collect()
        };

        for (id, callback) in callbacks {
            // no re-report on panic, that could recurse
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                tracing::error!(?id, "Error listener panicked");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn retain_except<C>(entries: &Mutex<Vec<Entry<C>>>, id: ObserverId) -> bool {
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    entries.retain(|entry| entry.id != id);
    entries.len() < before
}
