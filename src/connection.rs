//! Connection manager actor
//!
//! One task owns the socket, the state machine, the subscription ledger,
//! the dedup window and every timer. Handles talk to it through a command
//! mailbox; sockets talk to it through epoch-tagged transport events.
//! Anything tagged with an older epoch is dropped on arrival.

use crate::{
    cache::LatestValueCache,
    data::{ClientConfig, ClosedReason, ConnectionState, InboundEvent, Topic},
    dedup::{DedupBuffer, DedupOutcome},
    error::{describe_close_code, ConnectionError, ErrorReporter, SdkError},
    events::EventDispatcher,
    protocol::{FrameCodec, InboundFrame, OutboundFrame},
    retry::ReconnectAttempt,
    state::{StateMachine, TransitionTrigger},
    subscription::SubscriptionLedger,
    transport::{
        probe_health, resolve_token, ConnectRequest, EventSink, TaggedEvent, TokenProvider, Transport,
        TransportEvent, TransportLink,
    },
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Close code sent when the application tears the socket down
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code sent when the manager gives up on a socket it still holds
pub const FORCED_CLOSE_CODE: u16 = 4000;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const TRANSPORT_EVENT_BUFFER: usize = 1024;

/// Requests from handles to the actor
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    /// `held` is true when the handle took a gate hold the actor must release
    Stop { held: bool },
    Pause { held: bool },
    Resume,
    Reconnect,
    Subscribe(Vec<Topic>),
    Unsubscribe(Vec<Topic>),
    Send(OutboundFrame),
}

/// Consistent view of the manager published after every change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub desired: Vec<Topic>,
    pub confirmed: Vec<Topic>,
    /// Subscribe requests sent but not yet acknowledged
    pub pending: Vec<Topic>,
    pub reconnect_attempts: u32,
    /// Set once the reconnect ceiling is hit; cleared by the next Open
    pub terminal_error: Option<SdkError>,
    /// Message of the last ERROR frame
    pub server_error: Option<String>,
    pub epoch: u64,
}

/// Stream counters
#[derive(Debug, Default)]
pub struct StreamStats {
    frames_received: AtomicU64,
    events_delivered: AtomicU64,
    duplicates_dropped: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_frames: AtomicU64,
    reconnects_scheduled: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeat_timeouts: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub events_delivered: u64,
    pub duplicates_dropped: u64,
    pub malformed_frames: u64,
    pub unknown_frames: u64,
    pub reconnects_scheduled: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_timeouts: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_frames: self.unknown_frames.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Timer armed for one connection epoch
#[derive(Debug, Clone, Copy)]
struct Timer {
    epoch: u64,
    deadline: Instant,
}

impl Timer {
    fn after(epoch: u64, delay: Duration) -> Self {
        Self {
            epoch,
            deadline: Instant::now() + delay,
        }
    }
}

async fn expire(timer: Option<Timer>) {
    match timer {
        Some(timer) => sleep_until(timer.deadline).await,
        None => std::future::pending().await,
    }
}

/// Result of a spawned connect attempt
struct ConnectOutcome {
    epoch: u64,
    result: Result<TransportLink, ConnectionError>,
}

/// Collaborators the actor is built from
pub(crate) struct ActorParts {
    pub config: Arc<ClientConfig>,
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn FrameCodec>,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    pub dispatcher: Arc<EventDispatcher>,
    pub cache: LatestValueCache,
    pub stats: Arc<StreamStats>,
    pub commands: mpsc::Receiver<Command>,
    pub snapshot_tx: watch::Sender<StateSnapshot>,
}

pub(crate) struct ConnectionActor {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn FrameCodec>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    dispatcher: Arc<EventDispatcher>,
    cache: LatestValueCache,
    stats: Arc<StreamStats>,
    health_client: Option<reqwest::Client>,

    machine: StateMachine,
    ledger: SubscriptionLedger,
    dedup: DedupBuffer,
    attempts: ReconnectAttempt,
    epoch: u64,
    link: Option<TransportLink>,
    /// CONNECTION_ESTABLISHED seen for the current epoch
    greeted: bool,
    connect_task: Option<JoinHandle<()>>,
    /// Whether resume() should reconnect
    resume_intent: bool,
    terminal_error: Option<SdkError>,
    server_error: Option<String>,

    retry_timer: Option<Timer>,
    heartbeat_timer: Option<Timer>,
    pong_deadline: Option<Timer>,
    ack_deadline: Option<Timer>,

    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<TaggedEvent>,
    events_rx: mpsc::Receiver<TaggedEvent>,
    connect_tx: mpsc::Sender<ConnectOutcome>,
    connect_rx: mpsc::Receiver<ConnectOutcome>,
    snapshot_tx: watch::Sender<StateSnapshot>,
}

impl ConnectionActor {
    pub(crate) fn new(parts: ActorParts) -> Self {
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let (connect_tx, connect_rx) = mpsc::channel(8);
        let health_client = parts.config.health_check_url.as_ref().map(|_| reqwest::Client::new());
        let epoch = parts.dispatcher.gate().current();

        Self {
            dedup: DedupBuffer::new(parts.config.dedup_capacity),
            config: parts.config,
            transport: parts.transport,
            codec: parts.codec,
            token_provider: parts.token_provider,
            dispatcher: parts.dispatcher,
            cache: parts.cache,
            stats: parts.stats,
            health_client,
            machine: StateMachine::new(),
            ledger: SubscriptionLedger::new(),
            attempts: ReconnectAttempt::default(),
            epoch,
            link: None,
            greeted: false,
            connect_task: None,
            resume_intent: false,
            terminal_error: None,
            server_error: None,
            retry_timer: None,
            heartbeat_timer: None,
            pong_deadline: None,
            ack_deadline: None,
            commands: parts.commands,
            events_tx,
            events_rx,
            connect_tx,
            connect_rx,
            snapshot_tx: parts.snapshot_tx,
        }
    }

    /// Run until every handle is dropped
    pub(crate) async fn run(mut self) {
        tracing::debug!("Connection actor started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("All handles dropped; shutting down connection actor");
                        self.teardown(NORMAL_CLOSURE, "client dropped");
                        break;
                    }
                },
                Some(tagged) = self.events_rx.recv() => self.handle_transport_event(tagged),
                Some(outcome) = self.connect_rx.recv() => self.handle_connect_outcome(outcome),
                _ = expire(self.retry_timer) => self.on_retry_timer(),
                _ = expire(self.heartbeat_timer) => self.on_heartbeat_timer(),
                _ = expire(self.pong_deadline) => self.on_pong_deadline(),
                _ = expire(self.ack_deadline) => self.on_ack_deadline(),
            }
        }
    }

    fn state(&self) -> &ConnectionState {
        self.machine.state()
    }

    fn transition(&mut self, trigger: TransitionTrigger) -> bool {
        match self.machine.fire(trigger) {
            Ok(transition) => {
                self.publish();
                self.dispatcher.dispatch_state_change(&transition.to);
                true
            }
            Err(e) => {
                tracing::debug!("{}", e);
                false
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(StateSnapshot {
            state: self.state().clone(),
            desired: self.ledger.desired().iter().cloned().collect(),
            confirmed: self.ledger.confirmed().iter().cloned().collect(),
            pending: self.ledger.pending().iter().cloned().collect(),
            reconnect_attempts: self.attempts.count,
            terminal_error: self.terminal_error.clone(),
            server_error: self.server_error.clone(),
            epoch: self.epoch,
        });
    }

    fn cancel_timers(&mut self) {
        self.retry_timer = None;
        self.heartbeat_timer = None;
        self.pong_deadline = None;
        self.ack_deadline = None;
    }

    /// Invalidate everything tagged with the current epoch
    fn next_epoch(&mut self) {
        self.epoch = self.dispatcher.gate().advance();
    }

    /// Drop the socket (after a close frame) and any in-flight connect attempt
    fn teardown(&mut self, code: u16, reason: &str) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.close(code, reason);
        }
        self.greeted = false;
        self.cancel_timers();
        self.ledger.reset_confirmed();
    }

    // ---- commands ----

    fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, state = %self.state(), "Handling command");
        match command {
            Command::Start => self.start(),
            Command::Stop { held } => {
                self.stop();
                if held {
                    self.dispatcher.gate().release();
                }
            }
            Command::Pause { held } => {
                self.pause();
                if held {
                    self.dispatcher.gate().release();
                }
            }
            Command::Resume => self.resume(),
            Command::Reconnect => self.reconnect(),
            Command::Subscribe(topics) => self.subscribe(topics),
            Command::Unsubscribe(topics) => self.unsubscribe(topics),
            Command::Send(frame) => {
                if let Err(e) = self.send_checked(frame) {
                    ErrorReporter::report_error(&e, "send");
                    self.dispatcher.dispatch_error(&e);
                }
            }
        }
    }

    fn start(&mut self) {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::debug!("start() ignored: already {}", self.state());
            }
            ConnectionState::Suspended => {
                tracing::info!("start() while suspended; connecting on resume");
                self.resume_intent = true;
            }
            _ => {
                self.attempts.reset();
                self.terminal_error = None;
                if self.transition(TransitionTrigger::Start) {
                    self.begin_connect();
                }
            }
        }
    }

    fn stop(&mut self) {
        self.resume_intent = false;
        match self.state().clone() {
            ConnectionState::Connecting | ConnectionState::Open => {
                self.transition(TransitionTrigger::Stop);
                self.teardown(NORMAL_CLOSURE, "client stop");
                self.transition(TransitionTrigger::CloseComplete);
            }
            ConnectionState::Closed {
                reason: ClosedReason::Clean,
            }
            | ConnectionState::Idle => {
                self.teardown(NORMAL_CLOSURE, "client stop");
            }
            _ => {
                self.teardown(NORMAL_CLOSURE, "client stop");
                self.transition(TransitionTrigger::Stop);
            }
        }
        self.next_epoch();
        self.publish();
        tracing::info!(desired = self.ledger.desired().len(), "Stopped; subscriptions kept for next start");
    }

    fn pause(&mut self) {
        let state = self.state().clone();
        match state {
            ConnectionState::Suspended => {
                tracing::debug!("pause() ignored: already suspended");
                return;
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                self.resume_intent = true;
                self.transition(TransitionTrigger::Pause);
                self.teardown(NORMAL_CLOSURE, "client paused");
                self.transition(TransitionTrigger::SuspendComplete);
            }
            _ => {
                // a pending backoff retry is connect intent too
                self.resume_intent = self.retry_timer.is_some();
                self.teardown(NORMAL_CLOSURE, "client paused");
                self.transition(TransitionTrigger::Pause);
            }
        }
        self.next_epoch();
        self.publish();
    }

    fn resume(&mut self) {
        if *self.state() != ConnectionState::Suspended {
            tracing::debug!("resume() ignored in state {}", self.state());
            return;
        }
        let reconnect = std::mem::take(&mut self.resume_intent);
        if self.transition(TransitionTrigger::Resume { reconnect }) && reconnect {
            self.attempts.reset();
            self.begin_connect();
        }
    }

    fn reconnect(&mut self) {
        match self.state().clone() {
            ConnectionState::Suspended => {
                tracing::warn!("reconnect() ignored while suspended; call resume()");
                return;
            }
            ConnectionState::Connecting | ConnectionState::Open => {
                self.transition(TransitionTrigger::Stop);
                self.teardown(NORMAL_CLOSURE, "client reconnect");
                self.transition(TransitionTrigger::CloseComplete);
            }
            _ => self.teardown(NORMAL_CLOSURE, "client reconnect"),
        }
        self.attempts.reset();
        self.terminal_error = None;
        if self.transition(TransitionTrigger::Start) {
            self.begin_connect();
        }
    }

    fn subscribe(&mut self, topics: Vec<Topic>) {
        let added = self.ledger.desire(&topics);
        if !added.is_empty() {
            tracing::info!(topics = ?added, "Added to desired set");
        }

        if self.state().is_open() {
            let delta = self.ledger.subscribe_delta(&topics);
            self.request_subscribe(delta);
        }
        self.publish();
    }

    fn unsubscribe(&mut self, topics: Vec<Topic>) {
        let removed = self.ledger.release(&topics);
        for topic in &removed {
            self.cache.forget(topic);
            self.dedup.forget_topic(topic);
        }
        if !removed.is_empty() {
            tracing::info!(topics = ?removed, "Removed from desired set");
        }

        if self.state().is_open() {
            let delta = self.ledger.unsubscribe_delta(&topics);
            self.request_unsubscribe(delta);
        }
        self.publish();
    }

    // ---- outbound ----

    /// Ask for topics; confirmed on the spot when the endpoint selects the stream
    fn request_subscribe(&mut self, topics: Vec<Topic>) {
        if topics.is_empty() {
            return;
        }
        if self.codec.subscribes_in_band() {
            self.send_logged(OutboundFrame::Subscribe(topics));
        } else {
            self.ledger.ack_subscribed(&topics);
        }
    }

    fn request_unsubscribe(&mut self, topics: Vec<Topic>) {
        if topics.is_empty() {
            return;
        }
        if self.codec.subscribes_in_band() {
            self.send_logged(OutboundFrame::Unsubscribe(topics));
        } else {
            self.ledger.ack_unsubscribed(&topics);
        }
    }

    fn send_frame(&self, frame: &OutboundFrame) -> Result<(), SdkError> {
        let link = self.link.as_ref().ok_or(SdkError::SendFailedNotConnected)?;
        let text = self.codec.encode(frame)?;
        link.send_text(text)?;
        tracing::debug!(kind = frame.kind(), "Frame sent");
        Ok(())
    }

    fn send_checked(&self, frame: OutboundFrame) -> Result<(), SdkError> {
        if !self.state().is_open() {
            return Err(SdkError::SendFailedNotConnected);
        }
        self.send_frame(&frame)
    }

    /// Protocol frames: a failure here shows up as a close event shortly after
    fn send_logged(&self, frame: OutboundFrame) {
        if let Err(e) = self.send_frame(&frame) {
            tracing::warn!(kind = frame.kind(), "Failed to send frame: {}", e);
        }
    }

    // ---- connecting ----

    fn begin_connect(&mut self) {
        self.cancel_timers();
        self.next_epoch();
        self.greeted = false;
        let epoch = self.epoch;
        self.publish();

        let transport = Arc::clone(&self.transport);
        let token_provider = self.token_provider.clone();
        let config = Arc::clone(&self.config);
        let health_client = self.health_client.clone();
        let sink = EventSink::new(epoch, self.events_tx.clone());
        let connect_tx = self.connect_tx.clone();
        let handshake_timeout = self.config.handshake_timeout;

        if self.ack_awaited() {
            self.ack_deadline = Some(Timer::after(epoch, handshake_timeout));
        }

        tracing::info!(epoch, endpoint = %self.config.endpoint, "Connecting");
        let task = tokio::spawn(async move {
            let attempt = establish(transport, token_provider, config, health_client, sink);
            let result = match tokio::time::timeout(handshake_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::HandshakeTimeout(handshake_timeout)),
            };
            let _ = connect_tx.send(ConnectOutcome { epoch, result }).await;
        });
        self.connect_task = Some(task);
    }

    fn ack_awaited(&self) -> bool {
        self.config.await_server_ack
    }

    fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        self.connect_task = None;
        if outcome.epoch != self.epoch || *self.state() != ConnectionState::Connecting {
            // dropping a stale link closes its socket
            tracing::debug!(epoch = outcome.epoch, current = self.epoch, "Discarding stale connect result");
            return;
        }

        match outcome.result {
            Ok(link) => {
                self.link = Some(link);
                // the greeting may beat the connect result
                if self.ack_awaited() && !self.greeted {
                    tracing::debug!("Socket open, waiting for CONNECTION_ESTABLISHED");
                } else {
                    self.on_open();
                }
            }
            Err(error) => {
                let reason = error.to_string();
                self.connection_lost(TransitionTrigger::HandshakeFailed(reason.clone()), reason, error);
            }
        }
    }

    fn on_open(&mut self) {
        self.ack_deadline = None;
        if !self.transition(TransitionTrigger::HandshakeSucceeded) {
            return;
        }
        self.attempts.reset();
        self.terminal_error = None;

        let batch = self.ledger.begin_replay();
        if !batch.is_empty() {
            tracing::info!(count = batch.len(), "Replaying desired subscriptions");
            self.request_subscribe(batch);
        }

        if self.config.heartbeat.enabled {
            self.heartbeat_timer = Some(Timer::after(self.epoch, self.config.heartbeat.interval));
        }
        self.publish();
    }

    /// Socket gone or never came up: classify, clean up, maybe schedule a retry
    fn connection_lost(&mut self, trigger: TransitionTrigger, reason: String, error: ConnectionError) {
        self.teardown(FORCED_CLOSE_CODE, &reason);
        if !self.transition(trigger) {
            return;
        }
        ErrorReporter::report_error(&SdkError::Connection(error), "connection");
        self.next_epoch();
        self.schedule_reconnect(reason);
    }

    fn schedule_reconnect(&mut self, reason: String) {
        if !self.config.auto_reconnect {
            tracing::info!("Auto-reconnect disabled; staying closed");
            self.attempts.record_failure(reason);
            self.publish();
            return;
        }

        if !self.config.reconnect.should_retry(self.attempts.count) {
            let error = SdkError::ReconnectCeilingExceeded {
                attempts: self.attempts.count,
                last_reason: reason,
            };
            self.transition(TransitionTrigger::CeilingExceeded);
            ErrorReporter::report_error(&error, "reconnect");
            self.terminal_error = Some(error.clone());
            self.publish();
            self.dispatcher.dispatch_error(&error);
            return;
        }

        let delay = self.config.reconnect.next_delay(self.attempts.count);
        self.attempts.record_failure(reason);
        bump(&self.stats.reconnects_scheduled);
        tracing::info!(
            attempt = self.attempts.count,
            max_attempts = self.config.reconnect.max_attempts,
            ?delay,
            "Scheduling reconnect"
        );
        self.retry_timer = Some(Timer::after(self.epoch, delay));
        self.publish();
    }

    // ---- timers ----

    fn on_retry_timer(&mut self) {
        let Some(timer) = self.retry_timer.take() else {
            return;
        };
        if timer.epoch != self.epoch {
            tracing::debug!(timer = timer.epoch, current = self.epoch, "Stale retry timer");
            return;
        }
        let attempt = self.attempts.count;
        if self.transition(TransitionTrigger::RetryTimerFired { attempt }) {
            self.begin_connect();
        }
    }

    fn on_heartbeat_timer(&mut self) {
        let Some(timer) = self.heartbeat_timer.take() else {
            return;
        };
        if timer.epoch != self.epoch || !self.state().is_open() {
            return;
        }

        self.send_logged(OutboundFrame::Ping);
        bump(&self.stats.heartbeats_sent);
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(Timer::after(self.epoch, self.config.heartbeat.pong_timeout));
        }
        self.heartbeat_timer = Some(Timer::after(self.epoch, self.config.heartbeat.interval));
    }

    fn on_pong_deadline(&mut self) {
        let Some(timer) = self.pong_deadline.take() else {
            return;
        };
        if timer.epoch != self.epoch || !self.state().is_open() {
            return;
        }

        bump(&self.stats.heartbeat_timeouts);
        let grace = self.config.heartbeat.pong_timeout;
        tracing::warn!(?grace, "No pong received; forcing reconnect");
        self.connection_lost(
            TransitionTrigger::HeartbeatTimeout,
            "heartbeat timeout".to_string(),
            ConnectionError::HeartbeatTimeout(grace),
        );
    }

    fn on_ack_deadline(&mut self) {
        let Some(timer) = self.ack_deadline.take() else {
            return;
        };
        if timer.epoch != self.epoch || *self.state() != ConnectionState::Connecting {
            return;
        }
        let error = ConnectionError::HandshakeTimeout(self.config.handshake_timeout);
        let reason = error.to_string();
        self.connection_lost(TransitionTrigger::HandshakeFailed(reason.clone()), reason, error);
    }

    // ---- inbound ----

    fn handle_transport_event(&mut self, tagged: TaggedEvent) {
        if tagged.epoch != self.epoch {
            tracing::trace!(event_epoch = tagged.epoch, current = self.epoch, "Dropping stale transport event");
            return;
        }

        match tagged.event {
            TransportEvent::Message(text) => self.handle_frame(&text),
            TransportEvent::Error(message) => {
                tracing::warn!("Transport error: {}", message);
            }
            TransportEvent::Closed { code, reason, clean } => {
                let reason = if reason.is_empty() {
                    describe_close_code(code).to_string()
                } else {
                    reason
                };
                tracing::info!(code, %reason, clean, "Socket closed by peer");
                self.connection_lost(
                    TransitionTrigger::ConnectionLost {
                        code,
                        reason: reason.clone(),
                    },
                    format!("{} ({})", reason, code),
                    ConnectionError::DirtyClose { code, reason },
                );
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        bump(&self.stats.frames_received);
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                bump(&self.stats.malformed_frames);
                tracing::warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match frame {
            InboundFrame::ConnectionEstablished { message } => {
                tracing::info!(message = message.as_deref().unwrap_or(""), "Server acknowledged connection");
                if self.ack_awaited() && *self.state() == ConnectionState::Connecting {
                    if self.link.is_some() {
                        self.on_open();
                    } else {
                        self.greeted = true;
                    }
                }
            }
            InboundFrame::Subscribed { topics } => {
                let confirmed = self.ledger.ack_subscribed(&topics);
                tracing::debug!(?confirmed, "Subscription confirmed");
                self.publish();
            }
            InboundFrame::Unsubscribed { topics } => {
                let released = self.ledger.ack_unsubscribed(&topics);
                tracing::debug!(?released, "Unsubscription confirmed");
                self.publish();
            }
            InboundFrame::Update(event) => self.deliver(event),
            InboundFrame::Ping => self.send_logged(OutboundFrame::Pong),
            InboundFrame::Pong => {
                self.pong_deadline = None;
                self.cache.record_pong();
            }
            InboundFrame::Error { message } => {
                let error = SdkError::Server(message.clone());
                ErrorReporter::report_error(&error, "server");
                self.server_error = Some(message);
                self.publish();
                self.dispatcher.dispatch_error(&error);
            }
            InboundFrame::Unknown { kind } => {
                bump(&self.stats.unknown_frames);
                tracing::warn!(kind, "Ignoring unknown frame type");
            }
        }
    }

    fn deliver(&mut self, event: InboundEvent) {
        if !self.state().is_open() {
            tracing::debug!(topic = %event.topic, state = %self.state(), "Dropping update outside OPEN");
            return;
        }
        if !self.ledger.is_desired(event.topic.as_str()) {
            tracing::debug!(topic = %event.topic, "Dropping update for topic not subscribed");
            return;
        }
        if self.dedup.admit(&event) == DedupOutcome::Duplicate {
            bump(&self.stats.duplicates_dropped);
            return;
        }

        self.cache.write(&event);
        self.dispatcher.dispatch_event(self.epoch, &event);
        bump(&self.stats.events_delivered);
    }
}

/// Token, optional health probe, then the transport handshake
async fn establish(
    transport: Arc<dyn Transport>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    config: Arc<ClientConfig>,
    health_client: Option<reqwest::Client>,
    sink: EventSink,
) -> Result<TransportLink, ConnectionError> {
    let token = match &token_provider {
        Some(provider) => Some(resolve_token(provider.as_ref()).await?),
        None => None,
    };

    if let (Some(client), Some(url)) = (&health_client, &config.health_check_url) {
        probe_health(client, url, HEALTH_PROBE_TIMEOUT).await;
    }

    let request = ConnectRequest::build(&config.endpoint, &config.credential, token.as_deref())?;
    tracing::debug!(url = %request.redacted_url(), "Opening socket");
    transport.connect(request, sink).await
}
