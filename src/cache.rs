//! Latest-value cache
//!
//! Topic -> most recent payload, last write wins. Any number of readers may
//! hold a clone of the cache; only the connection manager writes to it.

use crate::data::{InboundEvent, Topic};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Cached entry for one topic
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub event: InboundEvent,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheInner {
    values: HashMap<Topic, CachedValue>,
    last_data_at: Option<Instant>,
    last_data_wall: Option<DateTime<Utc>>,
    last_pong_at: Option<Instant>,
    writes: u64,
}

/// Shared latest-value cache with stream freshness tracking
#[derive(Debug, Clone)]
pub struct LatestValueCache {
    inner: Arc<RwLock<CacheInner>>,
    freshness_window: Duration,
}

impl LatestValueCache {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            freshness_window,
        }
    }

    pub(crate) fn write(&self, event: &InboundEvent) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        inner.values.insert(
            event.topic.clone(),
            CachedValue {
                event: event.clone(),
                updated_at: now,
            },
        );
        inner.last_data_at = Some(Instant::now());
        inner.last_data_wall = Some(now);
        inner.writes += 1;
    }

    pub(crate) fn record_pong(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.last_pong_at = Some(Instant::now());
    }

    /// Latest payload for a topic
    pub fn get(&self, topic: &str) -> Option<serde_json::Value> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.values.get(topic).map(|v| v.event.payload.clone())
    }

    /// Latest full entry for a topic
    pub fn get_entry(&self, topic: &str) -> Option<CachedValue> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.values.get(topic).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.values.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<Topic> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<Topic> = inner.values.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn snapshot(&self) -> HashMap<Topic, serde_json::Value> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .values
            .iter()
            .map(|(topic, value)| (topic.clone(), value.event.payload.clone()))
            .collect()
    }

    /// Total cache writes since creation
    pub fn writes(&self) -> u64 {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).writes
    }

    /// Wall-clock time of the last data write
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).last_data_wall
    }

    /// True while data arrived within the freshness window (e.g. market is trading)
    pub fn is_live(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .last_data_at
            .map(|at| at.elapsed() < self.freshness_window)
            .unwrap_or(false)
    }

    /// Time since the server last answered a heartbeat
    pub fn since_last_pong(&self) -> Option<Duration> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.last_pong_at.map(|at| at.elapsed())
    }

    pub(crate) fn forget(&self, topic: &Topic) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.values.remove(topic);
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.values.clear();
        inner.last_data_at = None;
        inner.last_data_wall = None;
    }
}
