//! Scripted in-memory transport for driving a real connection manager

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_ws_sdk::{
    transport::OutboundCommand, ClientConfig, ConnectRequest, ConnectionError, EventSink, HeartbeatConfig,
    StreamClient, Transport, TransportEvent, TransportLink,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How the next connect attempt behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    Accept,
    /// Server writes this frame before the connect call returns
    GreetThenAccept(String),
    Refuse(String),
    /// Never completes; only the handshake timeout ends it
    Hang,
}

/// Server side of one accepted socket
pub struct MockConnection {
    pub request: ConnectRequest,
    pub sink: EventSink,
    pub outbound: mpsc::UnboundedReceiver<OutboundCommand>,
}

impl MockConnection {
    pub async fn push(&self, text: &str) {
        assert!(self.sink.emit(TransportEvent::Message(text.to_string())).await);
    }

    pub async fn push_json(&self, value: Value) {
        self.push(&value.to_string()).await;
    }

    /// Server or network drops the socket
    pub async fn drop_socket(&self, code: u16) {
        self.sink
            .emit(TransportEvent::Closed {
                code,
                reason: String::new(),
                clean: false,
            })
            .await;
    }

    /// Next text frame the client wrote, parsed as JSON
    pub async fn next_frame(&mut self, within: Duration) -> Option<Value> {
        let deadline = tokio::time::sleep(within);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                command = self.outbound.recv() => match command {
                    Some(OutboundCommand::Text(text)) => {
                        return Some(serde_json::from_str(&text).expect("client sent invalid JSON"));
                    }
                    Some(OutboundCommand::Close { .. }) | None => return None,
                },
                _ = &mut deadline => return None,
            }
        }
    }

    /// Everything already written, without waiting
    pub fn drain(&mut self) -> Vec<OutboundCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.outbound.try_recv() {
            commands.push(command);
        }
        commands
    }
}

#[derive(Default)]
struct Script {
    behaviors: VecDeque<Behavior>,
    attempts: Vec<Instant>,
}

/// Transport whose connect attempts follow a script (default: accept)
pub struct MockTransport {
    script: Mutex<Script>,
    accepted: mpsc::UnboundedSender<MockConnection>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockConnection>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: Mutex::new(Script::default()),
                accepted,
            }),
            rx,
        )
    }

    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.script.lock().unwrap().behaviors.extend(behaviors);
    }

    /// Instants of every connect attempt so far
    pub fn attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.script.lock().unwrap().attempts.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, request: ConnectRequest, sink: EventSink) -> Result<TransportLink, ConnectionError> {
        let behavior = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(Instant::now());
            script.behaviors.pop_front().unwrap_or(Behavior::Accept)
        };

        if let Behavior::GreetThenAccept(greeting) = &behavior {
            sink.emit(TransportEvent::Message(greeting.clone())).await;
            tokio::task::yield_now().await;
        }

        match behavior {
            Behavior::Accept | Behavior::GreetThenAccept(_) => {
                let (link, outbound) = TransportLink::channel();
                let _ = self.accepted.send(MockConnection {
                    request,
                    sink,
                    outbound,
                });
                Ok(link)
            }
            Behavior::Refuse(reason) => Err(ConnectionError::EstablishmentFailed(reason)),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Defaults with debounce and heartbeat out of the way
pub fn test_config() -> ClientConfig {
    ClientConfig {
        debounce_window: Duration::ZERO,
        heartbeat: HeartbeatConfig {
            enabled: false,
            ..HeartbeatConfig::default()
        },
        ..ClientConfig::default()
    }
}

pub fn client_with(config: ClientConfig) -> (StreamClient, Arc<MockTransport>, mpsc::UnboundedReceiver<MockConnection>) {
    let (transport, connections) = MockTransport::new();
    let client = StreamClient::builder()
        .config(config)
        .transport(transport.clone())
        .build()
        .expect("valid test config");
    (client, transport, connections)
}

/// Start the client and return the accepted socket once it is open
pub async fn open(client: &StreamClient, connections: &mut mpsc::UnboundedReceiver<MockConnection>) -> MockConnection {
    assert!(client.start());
    let connection = connections.recv().await.expect("transport dropped");
    client
        .wait_for_state(|state| state.is_open())
        .await
        .expect("manager stopped");
    connection
}

/// Poll `condition` on virtual time until it holds
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

pub fn subscribe_frame(topics: &[&str]) -> Value {
    serde_json::json!({ "type": "SUBSCRIBE", "topics": topics })
}
