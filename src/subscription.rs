//! Subscription ledger: desired vs. server-confirmed topic state

use crate::data::Topic;
use std::collections::BTreeSet;

/// Topics to add and remove to move `confirmed` towards `desired`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub to_subscribe: Vec<Topic>,
    pub to_unsubscribe: Vec<Topic>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.to_subscribe.is_empty() && self.to_unsubscribe.is_empty()
    }
}

/// Compute the subscribe/unsubscribe deltas between two topic sets.
///
/// Both outputs are sorted.
pub fn diff(desired: &BTreeSet<Topic>, confirmed: &BTreeSet<Topic>) -> SubscriptionDiff {
    SubscriptionDiff {
        to_subscribe: desired.difference(confirmed).cloned().collect(),
        to_unsubscribe: confirmed.difference(desired).cloned().collect(),
    }
}

/// Desired and confirmed subscription state of one manager.
///
/// `confirmed` only ever holds desired topics: removing a topic from the
/// desired set moves it out of `confirmed` into the pending-unsubscribe set
/// until the server acknowledges.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLedger {
    desired: BTreeSet<Topic>,
    confirmed: BTreeSet<Topic>,
    pending_subscribe: BTreeSet<Topic>,
    pending_unsubscribe: BTreeSet<Topic>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add topics to the desired set. Returns the topics that were not desired before.
    pub fn desire(&mut self, topics: &[Topic]) -> Vec<Topic> {
        topics
            .iter()
            .filter(|topic| self.desired.insert((*topic).clone()))
            .cloned()
            .collect()
    }

    /// Remove topics from the desired set. Returns the topics that were desired before.
    pub fn release(&mut self, topics: &[Topic]) -> Vec<Topic> {
        topics
            .iter()
            .filter(|topic| self.desired.remove(*topic))
            .cloned()
            .collect()
    }

    /// Topics from `topics` that still need a SUBSCRIBE on the live connection.
    ///
    /// Skips anything confirmed or already requested; marks the rest pending.
    pub fn subscribe_delta(&mut self, topics: &[Topic]) -> Vec<Topic> {
        let mut delta = Vec::new();
        for topic in topics {
            if !self.desired.contains(topic)
                || self.confirmed.contains(topic)
                || self.pending_subscribe.contains(topic)
            {
                continue;
            }
            self.pending_unsubscribe.remove(topic);
            self.pending_subscribe.insert(topic.clone());
            delta.push(topic.clone());
        }
        delta
    }

    /// Topics from `topics` that need an UNSUBSCRIBE on the live connection.
    ///
    /// Covers confirmed topics and topics whose subscribe ack is still outstanding.
    pub fn unsubscribe_delta(&mut self, topics: &[Topic]) -> Vec<Topic> {
        let mut delta = Vec::new();
        for topic in topics {
            if self.desired.contains(topic) {
                continue;
            }
            let was_confirmed = self.confirmed.remove(topic);
            let was_pending = self.pending_subscribe.remove(topic);
            if was_confirmed || was_pending {
                self.pending_unsubscribe.insert(topic.clone());
                delta.push(topic.clone());
            }
        }
        delta
    }

    /// Start a full replay after an Open transition.
    ///
    /// Confirmed state is treated as empty and the whole desired set is
    /// returned as one batch, every topic marked pending.
    pub fn begin_replay(&mut self) -> Vec<Topic> {
        self.reset_confirmed();
        let batch = diff(&self.desired, &self.confirmed).to_subscribe;
        self.pending_subscribe.extend(batch.iter().cloned());
        batch
    }

    /// Forget everything the server had confirmed (connection gone)
    pub fn reset_confirmed(&mut self) {
        self.confirmed.clear();
        self.pending_subscribe.clear();
        self.pending_unsubscribe.clear();
    }

    /// Apply a SUBSCRIBED ack. Returns topics that became confirmed.
    pub fn ack_subscribed(&mut self, topics: &[Topic]) -> Vec<Topic> {
        let mut confirmed = Vec::new();
        for topic in topics {
            self.pending_subscribe.remove(topic);
            if !self.desired.contains(topic) {
                tracing::debug!(%topic, "Ignoring subscribe ack for topic no longer desired");
                continue;
            }
            if self.confirmed.insert(topic.clone()) {
                confirmed.push(topic.clone());
            }
        }
        confirmed
    }

    /// Apply an UNSUBSCRIBED ack. Returns topics the server released.
    pub fn ack_unsubscribed(&mut self, topics: &[Topic]) -> Vec<Topic> {
        let mut released = Vec::new();
        for topic in topics {
            let was_pending = self.pending_unsubscribe.remove(topic);
            // An ack for a topic that is still desired means the server dropped it on its own
            let was_confirmed = self.confirmed.remove(topic);
            if was_pending || was_confirmed {
                released.push(topic.clone());
            }
        }
        released
    }

    pub fn desired(&self) -> &BTreeSet<Topic> {
        &self.desired
    }

    pub fn confirmed(&self) -> &BTreeSet<Topic> {
        &self.confirmed
    }

    pub fn pending(&self) -> &BTreeSet<Topic> {
        &self.pending_subscribe
    }

    pub fn is_desired(&self, topic: &str) -> bool {
        self.desired.contains(topic)
    }

    pub fn is_confirmed(&self, topic: &str) -> bool {
        self.confirmed.contains(topic)
    }
}
