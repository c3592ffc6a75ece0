//! # Stream WebSocket SDK
//!
//! A resilient client for long-lived streaming WebSocket connections: one
//! socket multiplexes many topic subscriptions, survives network flaps and
//! server restarts, drops duplicate events and keeps the latest value per
//! topic.
//!
//! ## Quick Start
//! ```rust,ignore
//! use stream_ws_sdk::prelude::*;
//!
//! let client = StreamClient::new(ClientConfig::from_env()?)?;
//! client.subscribe(["AAPL", "MSFT"])?;
//! client.on_event("AAPL", |event| println!("{}", event.payload))?;
//! client.start();
//!
//! // later
//! let price = client.get_latest("AAPL");
//! client.stop();
//! ```

pub mod cache;
pub mod client;
pub mod connection;
pub mod data;
pub mod dedup;
pub mod error;
pub mod events;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod state;
pub mod subscription;
pub mod transport;
pub mod visibility;

pub use cache::{CachedValue, LatestValueCache};
pub use client::{ClientConfigBuilder, StreamClient, StreamClientBuilder};
pub use connection::{StateSnapshot, StatsSnapshot};
pub use data::*;
pub use error::*;
pub use events::{Delivery, DeliveryGate, EventDispatcher, ObserverId};
pub use protocol::{FrameCodec, InboundFrame, JsonFrameCodec, OutboundFrame};
pub use rate_limit::{ActionGuard, ActionKind};
pub use registry::{StreamLease, StreamRegistry};
pub use retry::{ReconnectAttempt, ReconnectPolicy, ReconnectPolicyBuilder};
pub use state::{next_state, StateMachine, StateTransition, TransitionTrigger};
pub use subscription::{diff, SubscriptionDiff, SubscriptionLedger};
pub use transport::{
    ConnectRequest, EventSink, StaticTokenProvider, TokenProvider, Transport, TransportEvent, TransportLink,
    TungsteniteTransport,
};
pub use visibility::{VisibilityAction, VisibilityGate};

/// Prelude - minimal public API surface
///
/// Import with: `use stream_ws_sdk::prelude::*;`
pub mod prelude {
    /// Main entry point
    pub use crate::client::{StreamClient, StreamClientBuilder};

    /// Configuration
    pub use crate::client::ClientConfigBuilder;
    pub use crate::data::{ClientConfig, CredentialPlacement, Endpoint, HeartbeatConfig};
    pub use crate::retry::ReconnectPolicy;

    /// Core data types
    pub use crate::data::{ClosedReason, ConnectionState, InboundEvent, Topic};

    /// Errors
    pub use crate::error::SdkError;

    /// Sharing and host lifecycle
    pub use crate::registry::{StreamLease, StreamRegistry};
    pub use crate::visibility::VisibilityGate;

    /// Auth
    pub use crate::transport::{StaticTokenProvider, TokenProvider};
}

/// Initialize logging for binaries and demos. Honors `RUST_LOG`.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
