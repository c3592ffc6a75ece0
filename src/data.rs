//! Data models and configuration for the streaming connection

use crate::{
    error::{SdkError, SubscriptionError},
    retry::ReconnectPolicy,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Opaque key identifying a subscribable stream (instrument code, room id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a topic, rejecting blank keys. Surrounding whitespace is trimmed.
    pub fn new(key: impl AsRef<str>) -> Result<Self, SubscriptionError> {
        let trimmed = key.as_ref().trim();
        if trimmed.is_empty() {
            return Err(SubscriptionError::InvalidTopic(key.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Parse a batch of keys, silently skipping blank entries.
    ///
    /// Fails only when nothing usable is left.
    pub fn parse_all<I, S>(keys: I) -> Result<Vec<Topic>, SubscriptionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut topics: Vec<Topic> = keys.into_iter().filter_map(|k| Topic::new(k).ok()).collect();
        topics.sort();
        topics.dedup();
        if topics.is_empty() {
            return Err(SubscriptionError::Empty);
        }
        Ok(topics)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Topic {
    type Error = SubscriptionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Topic::new(value)
    }
}

/// An inbound data event after frame decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Event id used for duplicate suppression, when the server supplies one
    pub id: Option<String>,
    pub topic: Topic,
    /// Frame type the event arrived in, e.g. `STOCK_UPDATE`
    pub kind: String,
    pub sequence: Option<u64>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] id={} seq={:?} @ {}",
            self.kind,
            self.topic,
            self.id.as_deref().unwrap_or("-"),
            self.sequence,
            self.received_at
        )
    }
}

/// Connection state of a manager. Only the manager's state machine mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed { reason: ClosedReason },
    Suspended,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Closed after the reconnect ceiling was hit; only `start()` leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed {
                reason: ClosedReason::CeilingExceeded
            }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closing => write!(f, "CLOSING"),
            ConnectionState::Closed { reason } => write!(f, "CLOSED({:?})", reason),
            ConnectionState::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

/// Why a manager sits in the Closed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosedReason {
    /// Application-initiated; never auto-retried
    Clean,
    /// Network or server-initiated loss after the socket was open
    Dirty,
    /// Handshake failed, timed out, or no token was available
    HandshakeFailed,
    /// Terminal: attempt ceiling reached
    CeilingExceeded,
}

/// WebSocket endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint(String);

impl Endpoint {
    /// Use an explicit `ws://` or `wss://` URL
    pub fn new(url: &str) -> Result<Self, SdkError> {
        let endpoint = Self(url.to_string());
        endpoint.to_url()?;
        Ok(endpoint)
    }

    /// Derive the socket URL from the hosting page's origin: `https` pages use `wss`.
    pub fn from_page_origin(origin: &str, path: &str) -> Result<Self, SdkError> {
        let origin = Url::parse(origin)
            .map_err(|e| SdkError::Configuration(format!("Invalid page origin {}: {}", origin, e)))?;
        let scheme = if origin.scheme() == "https" { "wss" } else { "ws" };
        let host = origin
            .host_str()
            .ok_or_else(|| SdkError::Configuration("Page origin has no host".to_string()))?;
        let authority = match origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self::new(&format!("{}://{}{}", scheme, authority, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_url(&self) -> Result<Url, SdkError> {
        let url = Url::parse(&self.0)
            .map_err(|e| SdkError::Configuration(format!("Invalid endpoint {}: {}", self.0, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(SdkError::Configuration(format!(
                "Endpoint must be a ws:// or wss:// URL, got {}",
                self.0
            )));
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(SdkError::Configuration("Endpoint host cannot be empty".to_string()));
        }
        Ok(url)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self("ws://localhost:8080/ws/stocks".to_string())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the bearer credential travels with the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPlacement {
    /// Connect without a credential
    None,
    /// Append `?<name>=<token>` to the URL
    QueryParam(String),
    /// Send the token as `Sec-WebSocket-Protocol`
    Subprotocol,
}

impl Default for CredentialPlacement {
    fn default() -> Self {
        CredentialPlacement::QueryParam("token".to_string())
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Interval between PING frames while open
    pub interval: Duration,
    /// Grace window for the matching PONG
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub handshake_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
    pub auto_reconnect: bool,
    /// Minimum spacing between two public calls of the same kind
    pub debounce_window: Duration,
    /// Number of event ids remembered for duplicate suppression
    pub dedup_capacity: usize,
    /// A stream counts as live while data arrived within this window
    pub freshness_window: Duration,
    /// Stay in Connecting until the server sends CONNECTION_ESTABLISHED
    pub await_server_ack: bool,
    pub command_buffer: usize,
    pub credential: CredentialPlacement,
    pub health_check_url: Option<String>,
}

impl ClientConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), SdkError> {
        self.endpoint.to_url()?;

        if self.handshake_timeout.is_zero() {
            return Err(SdkError::Configuration("Handshake timeout must be greater than 0".to_string()));
        }

        if self.heartbeat.enabled && (self.heartbeat.interval.is_zero() || self.heartbeat.pong_timeout.is_zero()) {
            return Err(SdkError::Configuration(
                "Heartbeat interval and pong timeout must be greater than 0".to_string(),
            ));
        }

        if self.dedup_capacity == 0 {
            return Err(SdkError::Configuration("Dedup capacity must be greater than 0".to_string()));
        }

        if self.command_buffer == 0 {
            return Err(SdkError::Configuration("Command buffer must be greater than 0".to_string()));
        }

        if let Some(health) = &self.health_check_url {
            Url::parse(health)
                .map_err(|e| SdkError::Configuration(format!("Invalid health check URL: {}", e)))?;
        }

        self.reconnect.validate().map_err(SdkError::Configuration)?;

        Ok(())
    }

    /// Build a configuration from `STREAM_WS_*` environment variables, loading `.env` first
    pub fn from_env() -> Result<Self, SdkError> {
        let _ = dotenvy::dotenv();
        let mut config = ClientConfig::default();

        if let Ok(url) = std::env::var("STREAM_WS_URL") {
            config.endpoint = Endpoint::new(&url)?;
        } else if let Ok(origin) = std::env::var("STREAM_WS_PAGE_ORIGIN") {
            let path = std::env::var("STREAM_WS_PATH").unwrap_or_else(|_| "/ws/stocks".to_string());
            config.endpoint = Endpoint::from_page_origin(&origin, &path)?;
        }

        if let Some(ms) = env_number::<u64>("STREAM_WS_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }

        if let Some(attempts) = env_number::<u32>("STREAM_WS_MAX_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }

        if let Ok(health) = std::env::var("STREAM_WS_HEALTH_URL") {
            config.health_check_url = Some(health);
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, SdkError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SdkError::Configuration(format!("{} must be a number, got {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
            debounce_window: Duration::from_secs(2),
            dedup_capacity: 1000,
            freshness_window: Duration::from_secs(30),
            await_server_ack: false,
            command_buffer: 256,
            credential: CredentialPlacement::default(),
            health_check_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_trims_and_rejects_blank() {
        assert_eq!(Topic::new("  AAPL ").unwrap().as_str(), "AAPL");
        assert!(Topic::new("   ").is_err());
    }

    #[test]
    fn test_parse_all_skips_blank_and_duplicates() {
        let topics = Topic::parse_all(["005930", "", "005930", " 000660"]).unwrap();
        let keys: Vec<&str> = topics.iter().map(Topic::as_str).collect();
        assert_eq!(keys, vec!["000660", "005930"]);

        assert_eq!(Topic::parse_all(["", " "]), Err(SubscriptionError::Empty));
    }

    #[test]
    fn test_endpoint_scheme_follows_page_origin() {
        let secure = Endpoint::from_page_origin("https://example.com", "/ws/stocks").unwrap();
        assert_eq!(secure.as_str(), "wss://example.com/ws/stocks");

        let plain = Endpoint::from_page_origin("http://localhost:8080", "ws/chat/region").unwrap();
        assert_eq!(plain.as_str(), "ws://localhost:8080/ws/chat/region");
    }

    #[test]
    fn test_endpoint_rejects_http_scheme() {
        assert!(Endpoint::new("http://example.com/ws").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());

        let config = ClientConfig {
            dedup_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
