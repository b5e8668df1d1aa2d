//! Common Test Utilities
//!
//! An in-process loopback server standing in for the realtime endpoint,
//! plus fixtures shared across integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use chat_realtime::config::Settings;
use chat_realtime::domain::Credential;
use chat_realtime::gateway::codec::{self, Frame};
use chat_realtime::gateway::{Backoff, Session, SessionConfig, SessionEvent, SessionState};
use chat_realtime::infrastructure::transport::{Connection, Connector};
use chat_realtime::{RealtimeError, Result};

pub const VALID_TOKEN: &str = "valid-token";

pub const BASE_DELAY: Duration = Duration::from_millis(100);
pub const HEARTBEAT: Duration = Duration::from_millis(1000);

/// What the server does with the next handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    RejectAuth,
    FailTransport,
    /// Never completes
    Hang,
}

struct Live {
    id: usize,
    to_client: mpsc::UnboundedSender<String>,
    /// Topics subscribed on this connection, in arrival order
    subscriptions: Vec<String>,
}

struct ServerState {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    live: Mutex<Option<Live>>,
    connects: AtomicUsize,
    received: Mutex<Vec<Frame>>,
    echo_heartbeats: AtomicBool,
    next_message_id: AtomicU64,
    /// Destination answered with ERROR instead of RECEIPT
    rejected: Mutex<Option<(String, String)>>,
    /// How long a client close takes to complete
    close_delay: Mutex<Duration>,
}

/// Loopback realtime server. Implements [`Connector`] directly.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<ServerState>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Outcome::Accept),
                live: Mutex::new(None),
                connects: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                echo_heartbeats: AtomicBool::new(true),
                next_message_id: AtomicU64::new(1),
                rejected: Mutex::new(None),
                close_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Queue outcomes for the next handshakes.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.script.lock().extend(outcomes);
    }

    /// Outcome once the script is empty.
    pub fn set_fallback(&self, outcome: Outcome) {
        *self.state.fallback.lock() = outcome;
    }

    pub fn set_echo_heartbeats(&self, echo: bool) {
        self.state.echo_heartbeats.store(echo, Ordering::SeqCst);
    }

    /// Answer sends to `destination` with an ERROR frame.
    pub fn reject_destination(&self, destination: &str, message: &str) {
        *self.state.rejected.lock() = Some((destination.to_string(), message.to_string()));
    }

    /// Make every client-initiated close take `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.state.close_delay.lock() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.live.lock().is_some()
    }

    /// Topics subscribed on the current connection.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state
            .live
            .lock()
            .as_ref()
            .map(|live| live.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Every frame received from clients, across connections.
    pub fn received(&self) -> Vec<Frame> {
        self.state.received.lock().clone()
    }

    pub fn received_ops(&self, op: &str) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.op_name() == op)
            .collect()
    }

    /// Close the current connection from the server side.
    pub fn drop_connection(&self) {
        self.state.live.lock().take();
    }

    /// Publish on `topic`; delivered only if the client subscribed it on
    /// the current connection.
    pub fn publish(&self, topic: &str, payload: Value) -> bool {
        let live = self.state.live.lock();
        let Some(live) = live.as_ref() else {
            return false;
        };
        if !live.subscriptions.iter().any(|t| t == topic) {
            return false;
        }
        let frame = Frame::Message {
            topic: topic.to_string(),
            payload,
        };
        live.to_client
            .send(codec::encode(&frame).unwrap())
            .is_ok()
    }

    /// Push raw text to the client, bypassing subscription checks.
    pub fn push_raw(&self, text: &str) -> bool {
        self.state
            .live
            .lock()
            .as_ref()
            .is_some_and(|live| live.to_client.send(text.to_string()).is_ok())
    }

    fn next_outcome(&self) -> Outcome {
        let scripted = self.state.script.lock().pop_front();
        scripted.unwrap_or(*self.state.fallback.lock())
    }
}

#[async_trait]
impl Connector for LoopbackServer {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Connection>> {
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;

        match self.next_outcome() {
            Outcome::Accept if credential.token() == VALID_TOKEN => {}
            Outcome::Accept | Outcome::RejectAuth => {
                return Err(RealtimeError::Auth("handshake rejected with 401".into()))
            }
            Outcome::FailTransport => {
                return Err(RealtimeError::Transport("connection refused".into()))
            }
            Outcome::Hang => futures::future::pending::<()>().await,
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        *self.state.live.lock() = Some(Live {
            id,
            to_client,
            subscriptions: Vec::new(),
        });

        Ok(Box::new(LoopbackConnection {
            id,
            state: Arc::clone(&self.state),
            inbound,
        }))
    }
}

struct LoopbackConnection {
    id: usize,
    state: Arc<ServerState>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        let frame = codec::decode(&text).map_err(|e| RealtimeError::Transport(e.to_string()))?;

        let mut live = self.state.live.lock();
        let Some(live) = live.as_mut().filter(|live| live.id == self.id) else {
            return Err(RealtimeError::Transport("connection closed".into()));
        };
        self.state.received.lock().push(frame.clone());

        let reply = match frame {
            Frame::Subscribe { topic } => {
                if !live.subscriptions.contains(&topic) {
                    live.subscriptions.push(topic);
                }
                None
            }
            Frame::Unsubscribe { topic } => {
                live.subscriptions.retain(|t| t != &topic);
                None
            }
            Frame::Send {
                destination,
                receipt,
                ..
            } => {
                let rejection = self
                    .state
                    .rejected
                    .lock()
                    .as_ref()
                    .filter(|(rejected, _)| *rejected == destination)
                    .map(|(_, message)| message.clone());
                if let Some(message) = rejection {
                    let reply = Frame::Error {
                        receipt: Some(receipt),
                        message,
                    };
                    let _ = live.to_client.send(codec::encode(&reply).unwrap());
                    return Ok(());
                }
                let message_id = (destination == "/app/chat.send").then(|| {
                    let n = self.state.next_message_id.fetch_add(1, Ordering::SeqCst);
                    format!("srv-{}", n).into()
                });
                Some(Frame::Receipt {
                    receipt,
                    message_id,
                })
            }
            Frame::Heartbeat if self.state.echo_heartbeats.load(Ordering::SeqCst) => {
                Some(Frame::Heartbeat)
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let _ = live.to_client.send(codec::encode(&reply).unwrap());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        let delay = *self.state.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut live = self.state.live.lock();
        if live.as_ref().is_some_and(|l| l.id == self.id) {
            live.take();
        }
    }
}

/// Session tuning used across the tests.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: HEARTBEAT,
        max_missed_heartbeats: 2,
        connect_timeout: Duration::from_secs(1),
        send_timeout: Duration::from_secs(1),
        await_receipts: true,
        backoff: Backoff::new(BASE_DELAY, 3),
    }
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.realtime.heartbeat_interval_ms = HEARTBEAT.as_millis() as u64;
    settings.realtime.max_missed_heartbeats = 2;
    settings.realtime.connect_timeout_ms = 1_000;
    settings.realtime.send_timeout_ms = 1_000;
    settings.reconnect.base_delay_ms = BASE_DELAY.as_millis() as u64;
    settings.reconnect.max_attempts = 3;
    settings.conversation.history_page_size = 10;
    settings.conversation.typing_ttl_ms = 1_000;
    settings
}

pub fn credential() -> Credential {
    Credential::bearer(VALID_TOKEN)
}

/// Let spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Wait until the session reaches `state`.
pub async fn wait_for_state(session: &Session, state: SessionState) {
    let mut watch = session.watch_state();
    tokio::time::timeout(Duration::from_secs(60), watch.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for session state")
        .expect("session dropped");
}

/// Receive events until one matches.
pub async fn next_matching(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Room-topic payload for a delivered message.
pub fn message_payload(id: &str, chat_id: &str, sender: &str, body: &str) -> Value {
    json!({
        "type": "MESSAGE",
        "id": id,
        "chatId": chat_id,
        "senderId": sender,
        "body": body,
        "createdAt": "2024-05-01T12:00:00Z"
    })
}
