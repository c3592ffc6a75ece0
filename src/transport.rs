//! Socket transport and credential plumbing
//!
//! A [`Transport`] opens exactly one socket per `connect` call. Inbound
//! traffic flows into the manager through an [`EventSink`] tagged with the
//! connection epoch; outbound traffic goes through the returned
//! [`TransportLink`]. Dropping the link closes the socket.

use crate::{
    data::{CredentialPlacement, Endpoint},
    error::{describe_close_code, ConnectionError},
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use url::Url;

/// Close code used when the socket vanished without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Everything needed to open one socket
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub url: Url,
    /// Value for `Sec-WebSocket-Protocol`, when the credential travels there
    pub subprotocol: Option<String>,
}

impl ConnectRequest {
    /// Attach the credential to the endpoint according to `placement`
    pub fn build(
        endpoint: &Endpoint,
        placement: &CredentialPlacement,
        token: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let mut url = endpoint
            .to_url()
            .map_err(|e| ConnectionError::EstablishmentFailed(e.to_string()))?;
        let mut subprotocol = None;

        match (placement, token) {
            (CredentialPlacement::QueryParam(name), Some(token)) => {
                url.query_pairs_mut().append_pair(name, token);
            }
            (CredentialPlacement::Subprotocol, Some(token)) => {
                subprotocol = Some(token.to_string());
            }
            _ => {}
        }

        Ok(Self { url, subprotocol })
    }

    /// URL with the credential value masked, for logs
    pub fn redacted_url(&self) -> String {
        let mut url = self.url.clone();
        let pairs: Vec<(String, String)> = self.url.query_pairs().into_owned().collect();
        if pairs.is_empty() {
            return url.to_string();
        }
        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, _)| (k.as_str(), "***")));
        url.to_string()
    }
}

/// Lifecycle and data events surfaced by a socket
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Text frame
    Message(String),
    /// Socket is gone. `clean` is true when a close frame was received.
    Closed { code: u16, reason: String, clean: bool },
    /// Non-fatal socket error; a `Closed` event follows when the socket dies
    Error(String),
}

/// Transport event tagged with the epoch of the connection that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Where a socket pushes its inbound events
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::Sender<TaggedEvent>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::Sender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Push an event. Returns false once the manager has gone away.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .await
            .is_ok()
    }
}

/// Outbound instruction for the socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// Write half of an open connection
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<OutboundCommand>,
}

impl TransportLink {
    /// Create a link and the receiver its writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.outbound
            .send(OutboundCommand::Text(text))
            .map_err(|_| ConnectionError::DirtyClose {
                code: ABNORMAL_CLOSURE,
                reason: "socket writer is gone".to_string(),
            })
    }

    /// Request a close handshake. Best effort: the socket may already be gone.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(OutboundCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Opens sockets for the connection manager
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: ConnectRequest, sink: EventSink) -> Result<TransportLink, ConnectionError>;
}

/// Production transport on tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport;

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, request: ConnectRequest, sink: EventSink) -> Result<TransportLink, ConnectionError> {
        let mut client_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::EstablishmentFailed(format!("Invalid request: {}", e)))?;

        if let Some(protocol) = &request.subprotocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| ConnectionError::EstablishmentFailed(format!("Invalid subprotocol: {}", e)))?;
            client_request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (ws_stream, _response) = connect_async(client_request)
            .await
            .map_err(|e| ConnectionError::EstablishmentFailed(format!("Connection failed: {}", e)))?;
        tracing::debug!(epoch = sink.epoch(), url = %request.redacted_url(), "WebSocket handshake complete");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (link, mut outbound) = TransportLink::channel();

        // Protocol-level pings are answered by tungstenite while reading
        let receiver_task = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if !sink.emit(TransportEvent::Message(text)).await {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => {
                            if !sink.emit(TransportEvent::Message(text)).await {
                                return;
                            }
                        }
                        Err(_) => tracing::debug!("Ignoring non UTF-8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (1005, describe_close_code(1005).to_string()),
                        };
                        sink.emit(TransportEvent::Closed {
                            code,
                            reason,
                            clean: true,
                        })
                        .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(epoch = sink.epoch(), "WebSocket error: {}", e);
                        sink.emit(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            sink.emit(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: describe_close_code(ABNORMAL_CLOSURE).to_string(),
                clean: false,
            })
            .await;
        });

        tokio::spawn(async move {
            while let Some(command) = outbound.recv().await {
                match command {
                    OutboundCommand::Text(text) => {
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            tracing::warn!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    OutboundCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                            tracing::debug!("Close frame not sent: {}", e);
                        }
                        break;
                    }
                }
            }
            // link dropped or close requested: tear the socket down
            if let Err(e) = ws_sender.close().await {
                tracing::debug!("Socket close: {}", e);
            }
            receiver_task.abort();
        });

        Ok(link)
    }
}

/// Supplies the bearer credential for the handshake
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Option<String>;

    /// Try to obtain a fresh token. Returns whether a token is now available.
    async fn refresh_token(&self) -> bool;
}

/// Fixed token
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    async fn refresh_token(&self) -> bool {
        true
    }
}

/// Get a token, refreshing once when none is available
pub async fn resolve_token(provider: &dyn TokenProvider) -> Result<String, ConnectionError> {
    if let Some(token) = provider.get_token().await {
        return Ok(token);
    }

    tracing::info!("No auth token available, refreshing");
    if provider.refresh_token().await {
        if let Some(token) = provider.get_token().await {
            return Ok(token);
        }
    }
    Err(ConnectionError::TokenUnavailable)
}

/// Pre-connect health probe. Never fails the connection attempt.
pub async fn probe_health(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(url, status = %response.status(), "Health probe ok");
            true
        }
        Ok(response) => {
            tracing::warn!(url, status = %response.status(), "Health probe returned an error status");
            false
        }
        Err(e) => {
            tracing::warn!(url, "Health probe failed: {}", e);
            false
        }
    }
}
