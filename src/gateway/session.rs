//! Realtime Session
//!
//! One [`Session`] owns at most one live connection. All I/O happens on a
//! single spawned task (the driver) which:
//!
//! - opens the connection through a [`Connector`], bounded by the connect timeout
//! - asks the [`SessionListener`] for replay frames and writes them before
//!   publishing `Connected`
//! - multiplexes outbound commands, inbound frames and heartbeats
//! - reschedules itself with exponential backoff after an unexpected close
//!
//! Callers talk to the driver over an unbounded command channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::backoff::Backoff;
use super::codec::{self, Frame};
use crate::domain::{Credential, MessageId};
use crate::infrastructure::metrics;
use crate::infrastructure::transport::{Connection, Connector};
use crate::shared::error::{RealtimeError, Result};

/// How long `disconnect()` waits for queued frames to be flushed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientInitiated,
    RemoteClosed,
    HeartbeatTimeout,
    TransportError(String),
}

/// Lifecycle notifications broadcast to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Replay finished and the session is usable
    Connected,
    Disconnected { reason: DisconnectReason },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Terminal until the application calls `connect()` again
    ReconnectExhausted { attempts: u32 },
    AuthRejected { message: String },
}

/// Server acknowledgement of a `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub receipt: u64,
    pub message_id: Option<MessageId>,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Resolve sends on the server RECEIPT instead of on write
    pub await_receipts: bool,
    pub backoff: Backoff,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            await_receipts: true,
            backoff: Backoff::new(Duration::from_secs(1), 5),
        }
    }
}

/// Receives connection lifecycle callbacks on the I/O task.
///
/// Callbacks run inline on the driver and must not block.
pub trait SessionListener: Send + Sync {
    /// Called once per successful handshake, before `Connected` is published.
    /// The returned frames are written first, in order.
    fn on_connected(&self, link: &SessionLink) -> Vec<Frame>;

    /// An inbound frame that is not a receipt or heartbeat.
    fn on_frame(&self, frame: Frame);

    fn on_disconnected(&self);
}

/// Fire-and-forget handle onto the driver's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionLink {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionLink {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Queue a frame behind everything already queued. Returns false when
    /// the driver is gone.
    pub fn post(&self, frame: Frame) -> bool {
        self.commands.send(Command::Post(frame)).is_ok()
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Post(Frame),
    Send {
        destination: String,
        payload: Value,
        reply: oneshot::Sender<Result<Ack>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

enum Exit {
    Closed,
    Lost(DisconnectReason),
}

#[derive(Default)]
struct Control {
    pending: Option<ConnectFuture>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every `start`/`disconnect`; a driver only acts while its
    /// epoch is current.
    epoch: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    listener: Option<Weak<dyn SessionListener>>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    reconnect_attempt: AtomicU32,
    /// Set when the backoff budget ran out; cleared by the next `connect`
    exhausted: AtomicBool,
    next_receipt: AtomicU64,
    control: Mutex<Control>,
}

/// Realtime session handle. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Session without a listener; inbound frames are only logged.
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self::build(connector, config, None)
    }

    pub fn with_listener(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        listener: Weak<dyn SessionListener>,
    ) -> Self {
        Self::build(connector, config, Some(listener))
    }

    fn build(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        listener: Option<Weak<dyn SessionListener>>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                listener,
                state,
                events,
                reconnect_attempt: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
                next_receipt: AtomicU64::new(1),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempt.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Open the connection.
    ///
    /// Concurrent calls while connecting share one in-flight attempt; a call
    /// while connected returns immediately.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        let attempt = {
            let mut control = self.inner.control.lock();
            match self.state() {
                SessionState::Connected => return Ok(()),
                SessionState::Connecting => match control.pending.clone() {
                    Some(pending) => pending,
                    None => self.start(&mut control, credential),
                },
                SessionState::Disconnected | SessionState::Disconnecting => {
                    self.start(&mut control, credential)
                }
            }
        };
        attempt.await
    }

    fn start(&self, control: &mut Control, credential: Credential) -> ConnectFuture {
        if let Some(task) = control.task.take() {
            task.abort();
        }
        control.epoch += 1;
        let epoch = control.epoch;

        let (tx, rx) = mpsc::unbounded_channel();
        control.commands = Some(tx.clone());
        let (ready, attempt) = arm_pending(control);

        self.inner.reconnect_attempt.store(0, Ordering::SeqCst);
        self.inner.exhausted.store(false, Ordering::SeqCst);
        self.inner.publish_state(SessionState::Connecting);
        tracing::info!("Connecting realtime session");

        let driver = Arc::clone(&self.inner).drive(
            epoch,
            credential,
            rx,
            SessionLink::new(tx),
            ready,
        );
        control.task = Some(tokio::spawn(driver));
        attempt
    }

    /// Close the connection and cancel any connect or reconnect in flight.
    pub async fn disconnect(&self) {
        let (commands, task, epoch, was_connected) = {
            let mut control = self.inner.control.lock();
            let idle = control.task.as_ref().map_or(true, JoinHandle::is_finished);
            let was_connected = self.state() == SessionState::Connected;
            if idle && self.state() == SessionState::Disconnected {
                return;
            }
            control.epoch += 1;
            control.pending = None;
            self.inner.publish_state(SessionState::Disconnecting);
            (
                control.commands.take(),
                control.task.take(),
                control.epoch,
                was_connected,
            )
        };

        if was_connected {
            if let Some(commands) = commands {
                let (done, flushed) = oneshot::channel();
                if commands.send(Command::Disconnect { done }).is_ok()
                    && timeout(DISCONNECT_GRACE, flushed).await.is_err()
                {
                    tracing::warn!("Timed out flushing queued frames on disconnect");
                }
            }
        }
        if let Some(task) = task {
            task.abort();
        }

        // A connect issued while the close was flushing owns the session now
        if !self.inner.release(epoch) {
            tracing::debug!("Disconnect superseded by a newer connect");
            return;
        }
        self.inner.reconnect_attempt.store(0, Ordering::SeqCst);
        self.inner.emit(SessionEvent::Disconnected {
            reason: DisconnectReason::ClientInitiated,
        });
        tracing::info!("Realtime session disconnected by client");
    }

    /// Deliver `payload` to `destination`.
    ///
    /// Fails fast with `NotConnected` unless the session is connected, or
    /// with `ReconnectExhausted` once the backoff budget is spent.
    pub async fn send(&self, destination: &str, payload: Value) -> Result<Ack> {
        if self.state() != SessionState::Connected {
            let err = if self.inner.exhausted.load(Ordering::SeqCst) {
                RealtimeError::ReconnectExhausted {
                    attempts: self.inner.config.backoff.max_attempts(),
                }
            } else {
                RealtimeError::NotConnected
            };
            metrics::record_send(destination, Err(err.kind()), 0.0);
            return Err(err);
        }
        let commands = self
            .inner
            .control
            .lock()
            .commands
            .clone()
            .ok_or(RealtimeError::NotConnected)?;

        let started = Instant::now();
        let (reply, ack) = oneshot::channel();
        commands
            .send(Command::Send {
                destination: destination.to_string(),
                payload,
                reply,
            })
            .map_err(|_| RealtimeError::NotConnected)?;

        let result = match timeout(self.inner.config.send_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RealtimeError::Transport(
                "connection lost before acknowledgement".into(),
            )),
            Err(_) => Err(RealtimeError::Timeout(format!(
                "no acknowledgement for {} within {:?}",
                destination, self.inner.config.send_timeout
            ))),
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics::record_send(destination, Ok(()), elapsed),
            Err(e) => {
                tracing::warn!(destination, error = %e, "Send failed");
                metrics::record_send(destination, Err(e.kind()), elapsed);
            }
        }
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("reconnect_attempt", &self.reconnect_attempt())
            .finish()
    }
}

/// Install a fresh shared connect future; the returned sender resolves it.
/// A dropped sender resolves it as `Cancelled`.
fn arm_pending(control: &mut Control) -> (oneshot::Sender<Result<()>>, ConnectFuture) {
    let (tx, rx) = oneshot::channel::<Result<()>>();
    let pending = rx
        .map(|outcome| outcome.unwrap_or(Err(RealtimeError::Cancelled)))
        .boxed()
        .shared();
    control.pending = Some(pending.clone());
    (tx, pending)
}

impl Inner {
    fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Session state changed");
            metrics::set_session_state(state.as_str());
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// Re-enter Connecting for a reconnect attempt.
    fn rearm(&self, epoch: u64) -> Option<oneshot::Sender<Result<()>>> {
        let mut control = self.control.lock();
        if control.epoch != epoch {
            return None;
        }
        let (ready, _) = arm_pending(&mut control);
        self.publish_state(SessionState::Connecting);
        Some(ready)
    }

    /// Leave Connecting without a connection.
    fn abandon(&self, epoch: u64) -> bool {
        let mut control = self.control.lock();
        if control.epoch != epoch {
            return false;
        }
        control.pending = None;
        self.publish_state(SessionState::Disconnected);
        true
    }

    /// Leave Connected after the connection went away. The listener is
    /// taken offline under the same guard so a newer epoch cannot be
    /// overwritten by a stale one.
    fn release(&self, epoch: u64) -> bool {
        let mut control = self.control.lock();
        if control.epoch != epoch {
            return false;
        }
        control.pending = None;
        if let Some(listener) = self.listener() {
            listener.on_disconnected();
        }
        self.publish_state(SessionState::Disconnected);
        true
    }

    async fn drive(
        self: Arc<Self>,
        epoch: u64,
        credential: Credential,
        mut commands: mpsc::UnboundedReceiver<Command>,
        link: SessionLink,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let backoff = self.config.backoff;
        let mut ready = Some(ready);
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                let Some(delay) = backoff.delay_for(attempt) else {
                    let attempts = backoff.max_attempts();
                    tracing::warn!(attempts, "Reconnect attempts exhausted");
                    if self.abandon(epoch) {
                        self.exhausted.store(true, Ordering::SeqCst);
                        self.emit(SessionEvent::ReconnectExhausted { attempts });
                    }
                    return;
                };

                self.reconnect_attempt.store(attempt, Ordering::SeqCst);
                metrics::record_reconnect_attempt();
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
                tokio::time::sleep(delay).await;

                match self.rearm(epoch) {
                    Some(tx) => ready = Some(tx),
                    None => return,
                }
            }

            let handshake = self.connector.connect(&credential);
            let outcome = match timeout(self.config.connect_timeout, handshake).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RealtimeError::Timeout(format!(
                    "handshake did not complete within {:?}",
                    self.config.connect_timeout
                ))),
            };

            let conn = match outcome {
                Ok(conn) => conn,
                Err(RealtimeError::Auth(message)) => {
                    tracing::warn!(error = %message, "Credential rejected; not retrying");
                    if self.abandon(epoch) {
                        self.emit(SessionEvent::AuthRejected {
                            message: message.clone(),
                        });
                    }
                    resolve(&mut ready, Err(RealtimeError::Auth(message)));
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Connect attempt failed");
                    if !self.abandon(epoch) {
                        return;
                    }
                    resolve(&mut ready, Err(e));
                    attempt += 1;
                    continue;
                }
            };

            attempt = 0;
            self.reconnect_attempt.store(0, Ordering::SeqCst);

            match self.serve(epoch, conn, &mut commands, &link, &mut ready).await {
                Exit::Closed => return,
                Exit::Lost(reason) => {
                    tracing::warn!(?reason, "Realtime connection lost");
                    resolve(
                        &mut ready,
                        Err(RealtimeError::Transport(format!("connection lost: {:?}", reason))),
                    );
                    if !self.release(epoch) {
                        return;
                    }
                    self.emit(SessionEvent::Disconnected { reason });
                    fail_queued(&mut commands);
                    attempt = 1;
                }
            }
        }
    }

    async fn serve(
        &self,
        epoch: u64,
        mut conn: Box<dyn Connection>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        link: &SessionLink,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Exit {
        // Leftovers from the previous connection
        fail_queued(commands);

        let replay = {
            let control = self.control.lock();
            (control.epoch == epoch).then(|| {
                self.listener()
                    .map(|listener| listener.on_connected(link))
                    .unwrap_or_default()
            })
        };
        let Some(replay) = replay else {
            conn.close().await;
            return Exit::Closed;
        };
        let replayed = replay.len();
        for frame in &replay {
            if let Err(e) = write_frame(conn.as_mut(), frame).await {
                return Exit::Lost(DisconnectReason::TransportError(e.to_string()));
            }
        }

        let current = {
            let mut control = self.control.lock();
            let current = control.epoch == epoch;
            if current {
                control.pending = None;
                self.publish_state(SessionState::Connected);
            }
            current
        };
        if !current {
            conn.close().await;
            return Exit::Closed;
        }
        tracing::info!(replayed, "Realtime session connected");
        self.emit(SessionEvent::Connected);
        resolve(ready, Ok(()));

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;
        let mut acks: HashMap<u64, oneshot::Sender<Result<Ack>>> = HashMap::new();

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Post(frame)) => {
                        if let Err(e) = write_frame(conn.as_mut(), &frame).await {
                            return Exit::Lost(DisconnectReason::TransportError(e.to_string()));
                        }
                    }
                    Some(Command::Send { destination, payload, reply }) => {
                        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
                        let frame = Frame::Send { destination, receipt, payload };
                        match write_frame(conn.as_mut(), &frame).await {
                            Ok(()) if self.config.await_receipts => {
                                acks.insert(receipt, reply);
                            }
                            Ok(()) => {
                                let _ = reply.send(Ok(Ack { receipt, message_id: None }));
                            }
                            Err(e) if e.is_retryable() => {
                                let _ = reply.send(Err(e.clone()));
                                return Exit::Lost(DisconnectReason::TransportError(e.to_string()));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                        acks.retain(|_, waiter| !waiter.is_closed());
                    }
                    Some(Command::Disconnect { done }) => {
                        for (_, waiter) in acks.drain() {
                            let _ = waiter.send(Err(RealtimeError::NotConnected));
                        }
                        conn.close().await;
                        let _ = done.send(());
                        return Exit::Closed;
                    }
                    None => {
                        conn.close().await;
                        return Exit::Closed;
                    }
                },

                inbound = conn.recv() => match inbound {
                    Some(Ok(raw)) => {
                        missed = 0;
                        self.handle_inbound(&raw, &mut acks);
                    }
                    Some(Err(e)) => return Exit::Lost(DisconnectReason::TransportError(e.to_string())),
                    None => return Exit::Lost(DisconnectReason::RemoteClosed),
                },

                _ = heartbeat.tick() => {
                    missed += 1;
                    if missed >= self.config.max_missed_heartbeats {
                        return Exit::Lost(DisconnectReason::HeartbeatTimeout);
                    }
                    tracing::trace!(missed, "Sending heartbeat");
                    if let Err(e) = write_frame(conn.as_mut(), &Frame::Heartbeat).await {
                        return Exit::Lost(DisconnectReason::TransportError(e.to_string()));
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, raw: &str, acks: &mut HashMap<u64, oneshot::Sender<Result<Ack>>>) {
        let frame = match codec::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "Dropping undecodable frame");
                metrics::record_dropped_frame("decode");
                return;
            }
        };
        metrics::record_frame("inbound", frame.op_name());

        match frame {
            Frame::Heartbeat => tracing::trace!("Heartbeat received"),
            Frame::Receipt { receipt, message_id } => match acks.remove(&receipt) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(Ack { receipt, message_id }));
                }
                None => tracing::trace!(receipt, "Receipt for unknown send"),
            },
            Frame::Error {
                receipt: Some(receipt),
                message,
            } => match acks.remove(&receipt) {
                Some(waiter) => {
                    let _ = waiter.send(Err(RealtimeError::Rejected(message)));
                }
                None => tracing::warn!(receipt, %message, "Server error for unknown send"),
            },
            frame => match self.listener() {
                Some(listener) => listener.on_frame(frame),
                None => tracing::debug!(op = frame.op_name(), "No listener; frame ignored"),
            },
        }
    }
}

fn resolve(ready: &mut Option<oneshot::Sender<Result<()>>>, outcome: Result<()>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(outcome);
    }
}

/// Fail sends queued for a connection that no longer exists.
fn fail_queued(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(RealtimeError::NotConnected));
            }
            Command::Post(_) => {}
            Command::Disconnect { done } => {
                let _ = done.send(());
            }
        }
    }
}

async fn write_frame(conn: &mut dyn Connection, frame: &Frame) -> Result<()> {
    let text = codec::encode(frame)?;
    conn.send(text).await?;
    metrics::record_frame("outbound", frame.op_name());
    Ok(())
}
