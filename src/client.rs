//! Public handle of a streaming connection manager

use crate::{
    cache::{CachedValue, LatestValueCache},
    connection::{ActorParts, Command, ConnectionActor, StateSnapshot, StatsSnapshot, StreamStats},
    data::{ClientConfig, ConnectionState, CredentialPlacement, Endpoint, HeartbeatConfig, InboundEvent, Topic},
    error::SdkError,
    events::{EventDispatcher, ObserverId},
    protocol::{FrameCodec, JsonFrameCodec, OutboundFrame},
    rate_limit::{ActionGuard, ActionKind},
    retry::ReconnectPolicy,
    transport::{TokenProvider, Transport, TungsteniteTransport},
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;
use uuid::Uuid;

/// Cheap, cloneable handle to one connection manager.
///
/// Every mutating call enqueues a command for the manager's actor task and
/// returns immediately. The actor stops when the last handle is dropped.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: Uuid,
    config: Arc<ClientConfig>,
    commands: mpsc::Sender<Command>,
    dispatcher: Arc<EventDispatcher>,
    cache: LatestValueCache,
    stats: Arc<StreamStats>,
    snapshot: watch::Receiver<StateSnapshot>,
    guard: ActionGuard,
}

impl StreamClient {
    /// Client over a real WebSocket with the default JSON codec and no credential.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, SdkError> {
        StreamClientBuilder::new().config(config).build()
    }

    pub fn builder() -> StreamClientBuilder {
        StreamClientBuilder::new()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ---- lifecycle ----

    /// Connect. No-op while connecting or open.
    ///
    /// Returns false when the call was debounced or the manager is gone.
    pub fn start(&self) -> bool {
        self.guarded(ActionKind::Connect, Command::Start)
    }

    /// Clean shutdown. The desired subscriptions are kept for the next `start()`.
    ///
    /// Never debounced. No event observer runs after this returns.
    pub fn stop(&self) -> bool {
        self.held(Command::Stop { held: true })
    }

    /// Suspend the connection (host hidden). No event observer runs after this returns.
    pub fn pause(&self) -> bool {
        if !self.inner.guard.try_acquire(ActionKind::Pause) {
            return false;
        }
        self.held(Command::Pause { held: true })
    }

    /// Leave Suspended; reconnects only if the manager was connected before pausing
    pub fn resume(&self) -> bool {
        self.guarded(ActionKind::Connect, Command::Resume)
    }

    /// Tear down and connect again with a fresh attempt counter
    pub fn reconnect(&self) -> bool {
        self.guarded(ActionKind::Reconnect, Command::Reconnect)
    }

    fn guarded(&self, kind: ActionKind, command: Command) -> bool {
        if !self.inner.guard.try_acquire(kind) {
            return false;
        }
        self.enqueue(command).is_ok()
    }

    /// stop/pause: hold the delivery gate first so nothing fires after return
    fn held(&self, command: Command) -> bool {
        let gate = self.inner.dispatcher.gate();
        gate.hold();
        if self.enqueue(command).is_err() {
            gate.release();
            return false;
        }
        true
    }

    fn enqueue(&self, command: Command) -> Result<(), SdkError> {
        self.inner.commands.try_send(command).map_err(|e| {
            let error = match e {
                mpsc::error::TrySendError::Full(_) => SdkError::ManagerUnavailable("command queue full".to_string()),
                mpsc::error::TrySendError::Closed(_) => {
                    SdkError::ManagerUnavailable("connection actor has stopped".to_string())
                }
            };
            tracing::error!(client = %self.inner.id, "{}", error);
            error
        })
    }

    // ---- subscriptions ----

    /// Add topics to the desired set. Blank keys are skipped.
    pub fn subscribe<I, S>(&self, topics: I) -> Result<(), SdkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics = Topic::parse_all(topics)?;
        self.enqueue(Command::Subscribe(topics))
    }

    /// Remove topics from the desired set. Blank keys are skipped.
    pub fn unsubscribe<I, S>(&self, topics: I) -> Result<(), SdkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics = Topic::parse_all(topics)?;
        self.enqueue(Command::Unsubscribe(topics))
    }

    /// Topics the application wants
    pub fn desired_topics(&self) -> Vec<Topic> {
        self.inner.snapshot.borrow().desired.clone()
    }

    /// Topics the server has acknowledged
    pub fn confirmed_topics(&self) -> Vec<Topic> {
        self.inner.snapshot.borrow().confirmed.clone()
    }

    // ---- messaging ----

    /// Send an application message.
    ///
    /// Fails immediately with `SendFailedNotConnected` unless the connection
    /// is open. A connection lost before the message is written is reported
    /// to the error observers.
    pub fn send(&self, message: Value) -> Result<(), SdkError> {
        if !self.inner.snapshot.borrow().state.is_open() {
            return Err(SdkError::SendFailedNotConnected);
        }
        self.enqueue(Command::Send(OutboundFrame::Custom(message)))
    }

    // ---- observers ----

    /// Observe data events for one topic. Runs on the manager task and must not block.
    pub fn on_event<F>(&self, topic: &str, callback: F) -> Result<ObserverId, SdkError>
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let topic = Topic::new(topic)?;
        Ok(self.inner.dispatcher.register_topic(topic, Arc::new(callback)))
    }

    /// Observe data events for every topic
    pub fn on_any_event<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_any(Arc::new(callback))
    }

    pub fn on_state_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_state_listener(Arc::new(callback))
    }

    /// Observe surfaced errors: reconnect ceiling, failed sends, server ERROR frames
    pub fn on_error<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&SdkError) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_error_listener(Arc::new(callback))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.dispatcher.unregister(id)
    }

    // ---- queries ----

    /// Latest payload for a topic
    pub fn get_latest(&self, topic: &str) -> Option<Value> {
        self.inner.cache.get(topic)
    }

    pub fn get_latest_entry(&self, topic: &str) -> Option<CachedValue> {
        self.inner.cache.get_entry(topic)
    }

    pub fn get_state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.snapshot.borrow().state.is_open()
    }

    /// Data arrived within the freshness window
    pub fn is_live(&self) -> bool {
        self.inner.cache.is_live()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Watch every published snapshot
    pub fn state_changes(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Wait until the state matches `predicate`
    pub async fn wait_for_state<P>(&self, predicate: P) -> Result<StateSnapshot, SdkError>
    where
        P: Fn(&ConnectionState) -> bool,
    {
        let mut rx = self.inner.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(&snapshot.state))
            .await
            .map_err(|_| SdkError::ManagerUnavailable("connection actor has stopped".to_string()))?;
        Ok(snapshot.clone())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Shared read view of the latest-value cache
    pub fn cache(&self) -> LatestValueCache {
        self.inner.cache.clone()
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.get_state())
            .finish()
    }
}

/// Assembles a [`StreamClient`] from configuration and collaborators
pub struct StreamClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Arc<dyn FrameCodec>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl StreamClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
            codec: None,
            token_provider: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Validate the configuration and spawn the manager task
    pub fn build(self) -> Result<StreamClient, SdkError> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SdkError::Configuration("StreamClient must be built inside a tokio runtime".to_string()))?;

        let id = Uuid::new_v4();
        let config = Arc::new(self.config);
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (snapshot_tx, snapshot_rx) = watch::channel(StateSnapshot::default());
        let dispatcher = Arc::new(EventDispatcher::new());
        let cache = LatestValueCache::new(config.freshness_window);
        let stats = Arc::new(StreamStats::default());

        let actor = ConnectionActor::new(ActorParts {
            config: Arc::clone(&config),
            transport: self.transport.unwrap_or_else(|| Arc::new(TungsteniteTransport::new())),
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonFrameCodec::new())),
            token_provider: self.token_provider,
            dispatcher: Arc::clone(&dispatcher),
            cache: cache.clone(),
            stats: Arc::clone(&stats),
            commands: commands_rx,
            snapshot_tx,
        });
        let span = tracing::info_span!("stream_client", id = %id, endpoint = %config.endpoint);
        runtime.spawn(actor.run().instrument(span));
        tracing::info!(client = %id, endpoint = %config.endpoint, "Stream client created");

        Ok(StreamClient {
            inner: Arc::new(ClientInner {
                id,
                guard: ActionGuard::new(config.debounce_window),
                config,
                commands: commands_tx,
                dispatcher,
                cache,
                stats,
                snapshot: snapshot_rx,
            }),
        })
    }
}

impl Default for StreamClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder pattern for client configuration
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn disable_heartbeat(mut self) -> Self {
        self.config.heartbeat.enabled = false;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.config.debounce_window = window;
        self
    }

    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.config.dedup_capacity = capacity;
        self
    }

    pub fn freshness_window(mut self, window: Duration) -> Self {
        self.config.freshness_window = window;
        self
    }

    pub fn await_server_ack(mut self, enabled: bool) -> Self {
        self.config.await_server_ack = enabled;
        self
    }

    pub fn command_buffer(mut self, size: usize) -> Self {
        self.config.command_buffer = size;
        self
    }

    pub fn credential(mut self, placement: CredentialPlacement) -> Self {
        self.config.credential = placement;
        self
    }

    pub fn health_check_url(mut self, url: &str) -> Self {
        self.config.health_check_url = Some(url.to_string());
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<ClientConfig, SdkError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
