//! Duplicate suppression and per-topic arrival ordering
//!
//! Events are delivered in arrival order within a topic. Sequence numbers,
//! when present, are only observed: a regression is counted and logged but
//! the event is still delivered, since the wire format gives no reliable
//! ordering to restore.

use crate::data::{InboundEvent, Topic};
use std::collections::{HashMap, HashSet, VecDeque};

/// Bounded FIFO set of recently seen event ids.
///
/// When an insert pushes the window past capacity, the oldest half is
/// evicted. The newest ids are never evicted.
#[derive(Debug, Clone)]
pub struct SeenIdWindow {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIdWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            ids: HashSet::with_capacity(capacity + 1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Insert an id. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());

        if self.order.len() > self.capacity {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.ids.remove(&old);
            }
            tracing::debug!(evicted = evict, remaining = self.order.len(), "Seen-id window trimmed");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

/// Outcome of passing an event through the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Deliver to cache and observers
    Deliver,
    /// Id already seen; drop silently
    Duplicate,
}

/// Counters kept by the buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub without_id: u64,
    pub sequence_regressions: u64,
}

/// Dedup window plus per-topic sequence observation
#[derive(Debug, Clone)]
pub struct DedupBuffer {
    window: SeenIdWindow,
    last_sequence: HashMap<Topic, u64>,
    stats: DedupStats,
}

impl DedupBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: SeenIdWindow::new(capacity),
            last_sequence: HashMap::new(),
            stats: DedupStats::default(),
        }
    }

    /// Check an event against the window and record it
    pub fn admit(&mut self, event: &InboundEvent) -> DedupOutcome {
        match event.id.as_deref() {
            Some(id) => {
                if !self.window.insert(id) {
                    self.stats.duplicates += 1;
                    tracing::debug!(id, topic = %event.topic, "Dropping duplicate event");
                    return DedupOutcome::Duplicate;
                }
            }
            None => self.stats.without_id += 1,
        }

        if let Some(sequence) = event.sequence {
            match self.last_sequence.get(&event.topic) {
                Some(&last) if sequence <= last => {
                    self.stats.sequence_regressions += 1;
                    tracing::warn!(
                        topic = %event.topic,
                        last,
                        sequence,
                        "Out-of-order sequence, delivering in arrival order"
                    );
                }
                _ => {
                    self.last_sequence.insert(event.topic.clone(), sequence);
                }
            }
        }

        self.stats.accepted += 1;
        DedupOutcome::Deliver
    }

    /// Drop sequence tracking for a topic (after unsubscribe)
    pub fn forget_topic(&mut self, topic: &Topic) {
        self.last_sequence.remove(topic);
    }

    pub fn stats(&self) -> &DedupStats {
        &self.stats
    }

    pub fn window(&self) -> &SeenIdWindow {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(id: Option<&str>, topic: &str, sequence: Option<u64>) -> InboundEvent {
        InboundEvent {
            id: id.map(str::to_string),
            topic: Topic::new(topic).unwrap(),
            kind: "STOCK_UPDATE".to_string(),
            sequence,
            payload: json!({"price": 1}),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_rejects_duplicates() {
        let mut window = SeenIdWindow::new(10);
        assert!(window.insert("evt-1"));
        assert!(!window.insert("evt-1"));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_evicts_oldest_half() {
        let mut window = SeenIdWindow::new(4);
        for i in 0..4 {
            window.insert(&format!("evt-{}", i));
        }
        assert_eq!(window.len(), 4);

        // fifth insert overflows: oldest half goes, newest stays
        window.insert("evt-4");
        assert_eq!(window.len(), 3);
        assert!(!window.contains("evt-0"));
        assert!(!window.contains("evt-1"));
        assert!(window.contains("evt-2"));
        assert!(window.contains("evt-4"));
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = SeenIdWindow::new(1000);
        for i in 0..10_000 {
            window.insert(&format!("evt-{}", i));
            assert!(window.len() <= 1000);
        }
        assert!(window.contains("evt-9999"));
    }

    #[test]
    fn test_buffer_drops_duplicate_ids() {
        let mut buffer = DedupBuffer::new(100);
        assert_eq!(buffer.admit(&event(Some("evt-1"), "AAPL", None)), DedupOutcome::Deliver);
        assert_eq!(buffer.admit(&event(Some("evt-1"), "AAPL", None)), DedupOutcome::Duplicate);
        assert_eq!(buffer.stats().duplicates, 1);
        assert_eq!(buffer.stats().accepted, 1);
    }

    #[test]
    fn test_events_without_id_always_delivered() {
        let mut buffer = DedupBuffer::new(100);
        assert_eq!(buffer.admit(&event(None, "AAPL", None)), DedupOutcome::Deliver);
        assert_eq!(buffer.admit(&event(None, "AAPL", None)), DedupOutcome::Deliver);
        assert_eq!(buffer.stats().without_id, 2);
    }

    #[test]
    fn test_sequence_regression_still_delivered() {
        let mut buffer = DedupBuffer::new(100);
        buffer.admit(&event(Some("a"), "AAPL", Some(5)));
        let outcome = buffer.admit(&event(Some("b"), "AAPL", Some(3)));
        assert_eq!(outcome, DedupOutcome::Deliver);
        assert_eq!(buffer.stats().sequence_regressions, 1);

        // other topics track their own sequence
        buffer.admit(&event(Some("c"), "MSFT", Some(1)));
        assert_eq!(buffer.stats().sequence_regressions, 1);
    }
}
