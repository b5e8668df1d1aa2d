//! Conversation State Service
//!
//! Owns the local room book: which rooms exist, which one is active, their
//! buffers and unread counts. Fed by topic handlers registered through the
//! router; drives outbound chat actions on behalf of the UI.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::events::ConversationEvent;
use crate::domain::{
    ChatId, ConversationRoom, DeliveryState, InboundOutcome, Message, MessageId, MessageStore,
    OutgoingMessage, RoomState, RoomSummary, Topic, TypingSignal, UserId,
};
use crate::gateway::codec::{self, ReadReceiptPayload, RoomEventPayload, TypingPayload};
use crate::gateway::Router;
use crate::infrastructure::metrics;
use crate::shared::error::{RealtimeError, Result};

/// Conversation tuning
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub history_page_size: u32,
    /// How long a remote typing signal stays visible without renewal
    pub typing_ttl: Duration,
    pub event_channel_capacity: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_page_size: 30,
            typing_ttl: Duration::from_secs(3),
            event_channel_capacity: 256,
        }
    }
}

#[derive(Default)]
struct RoomBook {
    rooms: HashMap<ChatId, ConversationRoom>,
    active: Option<ChatId>,
}

impl RoomBook {
    fn is_focused(&self, chat_id: &ChatId) -> bool {
        self.active.as_ref() == Some(chat_id)
    }
}

struct Inner {
    local_user: UserId,
    router: Arc<Router>,
    store: Arc<dyn MessageStore>,
    config: ConversationConfig,
    book: Mutex<RoomBook>,
    events: broadcast::Sender<ConversationEvent>,
    /// Feeds the single store writer so appends land in buffer order
    appends: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Conversation state service. Cheap to clone.
#[derive(Clone)]
pub struct ConversationState {
    inner: Arc<Inner>,
}

impl ConversationState {
    /// Create the service and subscribe the local user's private queue.
    pub fn new(
        local_user: UserId,
        router: Arc<Router>,
        store: Arc<dyn MessageStore>,
        config: ConversationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let state = Self {
            inner: Arc::new(Inner {
                local_user,
                router,
                store,
                config,
                book: Mutex::new(RoomBook::default()),
                events,
                appends: Mutex::new(None),
            }),
        };

        let queue = Topic::user_queue(&state.inner.local_user);
        let weak = Arc::downgrade(&state.inner);
        state
            .inner
            .router
            .subscribe(queue, move |payload| with_state(&weak, |s| s.on_room_event(payload)));
        state
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    // Queries

    pub fn room(&self, chat_id: &ChatId) -> Option<RoomSummary> {
        self.inner.book.lock().rooms.get(chat_id).map(ConversationRoom::summary)
    }

    pub fn room_state(&self, chat_id: &ChatId) -> Option<RoomState> {
        self.inner.book.lock().rooms.get(chat_id).map(|room| room.state)
    }

    /// All rooms, most recently updated first.
    pub fn rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .inner
            .book
            .lock()
            .rooms
            .values()
            .map(ConversationRoom::summary)
            .collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rooms
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.inner
            .book
            .lock()
            .rooms
            .get(chat_id)
            .map(|room| room.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn outgoing(&self, chat_id: &ChatId) -> Vec<OutgoingMessage> {
        self.inner
            .book
            .lock()
            .rooms
            .get(chat_id)
            .map(|room| room.outbox().to_vec())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, chat_id: &ChatId) -> u32 {
        self.inner
            .book
            .lock()
            .rooms
            .get(chat_id)
            .map_or(0, |room| room.unread_count)
    }

    pub fn active_room(&self) -> Option<ChatId> {
        self.inner.book.lock().active.clone()
    }

    /// Remote users currently typing in `chat_id`.
    pub fn typing_users(&self, chat_id: &ChatId) -> Vec<UserId> {
        let now = Instant::now();
        self.inner
            .book
            .lock()
            .rooms
            .get(chat_id)
            .map(|room| room.typing_users(now))
            .unwrap_or_default()
    }

    pub fn read_marker(&self, chat_id: &ChatId, user_id: &UserId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner
            .book
            .lock()
            .rooms
            .get(chat_id)
            .and_then(|room| room.read_marker(user_id))
    }

    // Room lifecycle

    /// Room for a private chat with `peer`, created locally if unknown.
    ///
    /// The id is derived from both participants, so either side asking
    /// yields the same room.
    pub fn create_or_get_private(&self, peer: &UserId) -> ChatId {
        let chat_id = ChatId::private(&self.inner.local_user, peer);
        let created = {
            let mut book = self.inner.book.lock();
            if book.rooms.contains_key(&chat_id) {
                false
            } else {
                let room = ConversationRoom::new(
                    chat_id.clone(),
                    [self.inner.local_user.clone(), peer.clone()],
                );
                book.rooms.insert(chat_id.clone(), room);
                true
            }
        };
        if created {
            tracing::debug!(chat_id = %chat_id, peer = %peer, "Created private room");
            self.emit(ConversationEvent::RoomUpdated {
                chat_id: chat_id.clone(),
            });
        }
        chat_id
    }

    /// Merge a fetched room list into the book. Known rooms keep their
    /// buffers; metadata is refreshed when the summary is newer.
    pub fn hydrate_rooms(&self, summaries: impl IntoIterator<Item = RoomSummary>) {
        let mut updated = Vec::new();
        {
            let mut book = self.inner.book.lock();
            for summary in summaries {
                let chat_id = summary.chat_id.clone();
                match book.rooms.get_mut(&chat_id) {
                    Some(room) => {
                        room.participants.extend(summary.participants);
                        if summary.updated_at > room.updated_at {
                            room.updated_at = summary.updated_at;
                            if summary.last_message.is_some() {
                                room.last_message = summary.last_message;
                            }
                        }
                    }
                    None => {
                        book.rooms
                            .insert(chat_id.clone(), ConversationRoom::from_summary(summary));
                    }
                }
                updated.push(chat_id);
            }
        }
        tracing::debug!(rooms = updated.len(), "Hydrated room list");
        for chat_id in updated {
            self.emit(ConversationEvent::RoomUpdated { chat_id });
        }
    }

    /// Focus `chat_id`.
    ///
    /// The previously active room moves to Background. The room is
    /// subscribed if needed and marked read; an empty room loads its first
    /// history page (Loading until it arrives).
    pub async fn open_room(&self, chat_id: &ChatId) -> Result<()> {
        let mut changes = Vec::new();
        let needs_history = {
            let mut book = self.inner.book.lock();
            if !book.rooms.contains_key(chat_id) {
                return Err(RealtimeError::UnknownRoom(chat_id.to_string()));
            }

            if let Some(previous) = book.active.replace(chat_id.clone()) {
                if &previous != chat_id {
                    if let Some(room) = book.rooms.get_mut(&previous) {
                        room.move_to_background();
                        changes.push(ConversationEvent::RoomStateChanged {
                            chat_id: previous.clone(),
                            state: room.state,
                        });
                    }
                }
            }

            let room = book
                .rooms
                .get_mut(chat_id)
                .ok_or_else(|| RealtimeError::UnknownRoom(chat_id.to_string()))?;
            // First open: live traffic may already be buffered, history is not
            let needs_history = room.next_history_page() == Some(0);
            room.state = if needs_history {
                RoomState::Loading
            } else {
                RoomState::Active
            };
            changes.push(ConversationEvent::RoomStateChanged {
                chat_id: chat_id.clone(),
                state: room.state,
            });
            if room.mark_read() {
                changes.push(ConversationEvent::UnreadChanged {
                    chat_id: chat_id.clone(),
                    unread_count: 0,
                });
            }
            needs_history
        };
        for event in changes {
            self.emit(event);
        }
        tracing::debug!(chat_id = %chat_id, needs_history, "Opened room");

        self.ensure_room_subscriptions(chat_id);

        if let Err(e) = self.inner.router.mark_read(chat_id).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send read marker");
        }

        if !needs_history {
            return Ok(());
        }
        let loaded = self.load_more_history(chat_id).await;

        let settled = {
            let mut book = self.inner.book.lock();
            let focused = book.is_focused(chat_id);
            book.rooms.get_mut(chat_id).and_then(|room| {
                if room.state != RoomState::Loading {
                    return None;
                }
                room.state = if focused {
                    RoomState::Active
                } else {
                    RoomState::Background
                };
                Some(room.state)
            })
        };
        if let Some(state) = settled {
            self.emit(ConversationEvent::RoomStateChanged {
                chat_id: chat_id.clone(),
                state,
            });
        }
        loaded.map(|_| ())
    }

    /// Unfocus the active room; it keeps buffering in Background.
    pub fn leave_room(&self) -> Option<ChatId> {
        let left = {
            let mut book = self.inner.book.lock();
            let chat_id = book.active.take()?;
            let state = book.rooms.get_mut(&chat_id).map(|room| {
                room.move_to_background();
                room.state
            });
            state.map(|state| (chat_id, state))
        };
        let (chat_id, state) = left?;
        self.emit(ConversationEvent::RoomStateChanged {
            chat_id: chat_id.clone(),
            state,
        });
        Some(chat_id)
    }

    /// Reset unread locally and tell the server.
    pub async fn mark_read(&self, chat_id: &ChatId) -> Result<()> {
        let changed = {
            let mut book = self.inner.book.lock();
            let room = book
                .rooms
                .get_mut(chat_id)
                .ok_or_else(|| RealtimeError::UnknownRoom(chat_id.to_string()))?;
            room.mark_read()
        };
        if changed {
            self.emit(ConversationEvent::UnreadChanged {
                chat_id: chat_id.clone(),
                unread_count: 0,
            });
        }
        self.inner.router.mark_read(chat_id).await.map(|_| ())
    }

    /// Fetch the next older history page. Returns how many messages were
    /// inserted; 0 once history is exhausted.
    pub async fn load_more_history(&self, chat_id: &ChatId) -> Result<usize> {
        let next = {
            let book = self.inner.book.lock();
            let room = book
                .rooms
                .get(chat_id)
                .ok_or_else(|| RealtimeError::UnknownRoom(chat_id.to_string()))?;
            room.next_history_page()
        };
        let Some(page) = next else {
            return Ok(0);
        };

        let size = self.inner.config.history_page_size;
        let fetched = self
            .inner
            .store
            .fetch_history(chat_id, page, size)
            .await
            .inspect_err(|e| {
                tracing::warn!(chat_id = %chat_id, page, error = %e, "History fetch failed");
            })?;

        let has_more = fetched.has_more;
        let inserted = {
            let mut book = self.inner.book.lock();
            let Some(room) = book.rooms.get_mut(chat_id) else {
                return Ok(0);
            };
            // a concurrent load already advanced the cursor
            if room.next_history_page() != Some(page) {
                return Ok(0);
            }
            room.advance_history(page, has_more);
            room.prepend_history(fetched.items)
        };

        tracing::debug!(chat_id = %chat_id, page, inserted, has_more, "Loaded history page");
        self.emit(ConversationEvent::HistoryLoaded {
            chat_id: chat_id.clone(),
            inserted,
            has_more,
        });
        Ok(inserted)
    }

    // Inbound

    /// Feed a delivered message into its room, creating the room when the
    /// message arrives for a chat not seen before.
    pub fn handle_inbound_message(&self, message: Message) -> InboundOutcome {
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();
        let mut changes = Vec::new();

        let outcome = {
            let mut book = self.inner.book.lock();
            let focused = book.is_focused(&chat_id);
            let room = book.rooms.entry(chat_id.clone()).or_insert_with(|| {
                ConversationRoom::new(
                    chat_id.clone(),
                    [self.inner.local_user.clone(), message.sender_id.clone()],
                )
            });
            let had_typing = !room.typing_users(Instant::now()).is_empty();
            let outcome = room.record_inbound(message.clone(), &self.inner.local_user, focused);

            if let InboundOutcome::Appended { counted_unread } = outcome {
                self.persist(message);
                changes.push(ConversationEvent::MessageAppended {
                    chat_id: chat_id.clone(),
                    message_id: message_id.clone(),
                });
                changes.push(ConversationEvent::RoomUpdated {
                    chat_id: chat_id.clone(),
                });
                if counted_unread {
                    changes.push(ConversationEvent::UnreadChanged {
                        chat_id: chat_id.clone(),
                        unread_count: room.unread_count,
                    });
                }
                let users = room.typing_users(Instant::now());
                if had_typing && users.is_empty() {
                    changes.push(ConversationEvent::TypingChanged {
                        chat_id: chat_id.clone(),
                        users,
                    });
                }
            }
            outcome
        };

        if outcome == InboundOutcome::Duplicate {
            tracing::debug!(chat_id = %chat_id, message_id = %message_id, "Dropping duplicate message");
        }
        for event in changes {
            self.emit(event);
        }
        outcome
    }

    /// Record that another participant read `chat_id`.
    pub fn handle_read_receipt(&self, receipt: ReadReceiptPayload) {
        let recorded = {
            let mut book = self.inner.book.lock();
            match book.rooms.get_mut(&receipt.chat_id) {
                Some(room) => {
                    room.record_read(receipt.user_id.clone(), receipt.read_at);
                    true
                }
                None => false,
            }
        };
        if recorded {
            self.emit(ConversationEvent::ReadReceipt {
                chat_id: receipt.chat_id,
                user_id: receipt.user_id,
            });
        } else {
            tracing::debug!(chat_id = %receipt.chat_id, "Read receipt for unknown room");
        }
    }

    /// Apply a remote typing signal. Signals expire after the typing TTL
    /// unless renewed.
    pub fn handle_typing(&self, chat_id: &ChatId, user_id: &UserId, is_typing: bool) {
        if user_id == &self.inner.local_user {
            return;
        }
        let expires_at = Instant::now() + self.inner.config.typing_ttl;

        let users = {
            let mut book = self.inner.book.lock();
            let Some(room) = book.rooms.get_mut(chat_id) else {
                tracing::debug!(chat_id = %chat_id, "Typing signal for unknown room");
                return;
            };
            let changed = if is_typing {
                room.set_typing(TypingSignal::new(chat_id.clone(), user_id.clone(), expires_at));
                true
            } else {
                room.clear_typing(user_id)
            };
            if !changed {
                return;
            }
            room.typing_users(Instant::now())
        };

        self.emit(ConversationEvent::TypingChanged {
            chat_id: chat_id.clone(),
            users,
        });

        if is_typing {
            let weak = Arc::downgrade(&self.inner);
            let chat_id = chat_id.clone();
            spawn_detached(async move {
                tokio::time::sleep_until(expires_at).await;
                with_state(&weak, |state| state.purge_typing(&chat_id));
            });
        }
    }

    fn purge_typing(&self, chat_id: &ChatId) {
        let users = {
            let mut book = self.inner.book.lock();
            let Some(room) = book.rooms.get_mut(chat_id) else {
                return;
            };
            if !room.purge_expired_typing(Instant::now()) {
                return;
            }
            room.typing_users(Instant::now())
        };
        self.emit(ConversationEvent::TypingChanged {
            chat_id: chat_id.clone(),
            users,
        });
    }

    // Outbound

    /// Send a message as the local user.
    ///
    /// The message is tracked in the room outbox under a local id, which is
    /// returned on success. A failed send leaves the entry Failed for
    /// [`retry_message`](Self::retry_message).
    pub async fn send_message(&self, chat_id: &ChatId, body: impl Into<String>) -> Result<Uuid> {
        let outgoing = OutgoingMessage::new(chat_id.clone(), body);
        let local_id = outgoing.local_id;
        {
            let mut book = self.inner.book.lock();
            let room = book
                .rooms
                .get_mut(chat_id)
                .ok_or_else(|| RealtimeError::UnknownRoom(chat_id.to_string()))?;
            room.push_outgoing(outgoing);
        }
        self.attempt_send(chat_id, local_id).await?;
        Ok(local_id)
    }

    /// Resend a Failed outgoing message under the same local id.
    pub async fn retry_message(&self, chat_id: &ChatId, local_id: Uuid) -> Result<()> {
        let state = {
            let mut book = self.inner.book.lock();
            book.rooms
                .get_mut(chat_id)
                .ok_or_else(|| RealtimeError::UnknownRoom(chat_id.to_string()))?
                .outgoing_mut(local_id)
                .map(|outgoing| outgoing.state)
        };
        match state {
            Some(DeliveryState::Failed) => self.attempt_send(chat_id, local_id).await,
            Some(_) => Ok(()),
            None => Err(RealtimeError::Rejected(format!(
                "no outgoing message {} in {}",
                local_id, chat_id
            ))),
        }
    }

    async fn attempt_send(&self, chat_id: &ChatId, local_id: Uuid) -> Result<()> {
        let body = self
            .update_outgoing(chat_id, local_id, |outgoing| {
                outgoing.begin_attempt();
                outgoing.body.clone()
            })
            .ok_or_else(|| RealtimeError::UnknownRoom(chat_id.to_string()))?;

        match self.inner.router.send_message(chat_id, &body).await {
            Ok(ack) => {
                self.update_outgoing(chat_id, local_id, |outgoing| {
                    outgoing.mark_sent(ack.message_id.clone())
                });
                self.record_sent(chat_id, local_id, body, ack.message_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, %local_id, error = %e, "Message send failed");
                self.update_outgoing(chat_id, local_id, |outgoing| outgoing.mark_failed(&e));
                Err(e)
            }
        }
    }

    /// Fold an acknowledged send into its room. With a server id the
    /// message joins the buffer through the same dedup path as inbound
    /// traffic, so its later echo is dropped and the outbox entry retires.
    fn record_sent(&self, chat_id: &ChatId, local_id: Uuid, body: String, server_id: Option<MessageId>) {
        let Some(server_id) = server_id else {
            let touched = {
                let mut book = self.inner.book.lock();
                book.rooms
                    .get_mut(chat_id)
                    .map(|room| room.updated_at = Utc::now())
                    .is_some()
            };
            if touched {
                self.emit(ConversationEvent::RoomUpdated {
                    chat_id: chat_id.clone(),
                });
            }
            return;
        };

        let message = Message::new(
            server_id,
            chat_id.clone(),
            self.inner.local_user.clone(),
            body,
            Utc::now(),
        );
        self.handle_inbound_message(message);

        // Covers an echo that arrived before the receipt
        let retired = {
            let mut book = self.inner.book.lock();
            book.rooms
                .get_mut(chat_id)
                .is_some_and(|room| room.retire_delivered(local_id))
        };
        if retired {
            tracing::trace!(%local_id, "Outgoing message delivered; retired");
        }
    }

    /// Queue `message` for the store writer, starting the writer on first
    /// use or after its runtime went away.
    fn persist(&self, message: Message) {
        let mut appends = self.inner.appends.lock();
        if appends.as_ref().map_or(true, mpsc::UnboundedSender::is_closed) {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::debug!(message_id = %message.id, "No runtime; message not persisted");
                return;
            };
            let (sender, receiver) = mpsc::unbounded_channel();
            handle.spawn(write_behind(Arc::clone(&self.inner.store), receiver));
            *appends = Some(sender);
        }
        if let Some(sender) = appends.as_ref() {
            let _ = sender.send(message);
        }
    }

    /// Mutate an outbox entry and broadcast its new delivery state.
    fn update_outgoing<T>(
        &self,
        chat_id: &ChatId,
        local_id: Uuid,
        apply: impl FnOnce(&mut OutgoingMessage) -> T,
    ) -> Option<T> {
        let (result, state) = {
            let mut book = self.inner.book.lock();
            let outgoing = book.rooms.get_mut(chat_id)?.outgoing_mut(local_id)?;
            let result = apply(outgoing);
            (result, outgoing.state)
        };
        self.emit(ConversationEvent::OutgoingChanged {
            chat_id: chat_id.clone(),
            local_id,
            state,
        });
        Some(result)
    }

    // Topic handlers

    fn ensure_room_subscriptions(&self, chat_id: &ChatId) {
        let registry = self.inner.router.registry();

        let messages = Topic::room_messages(chat_id);
        if !registry.contains(&messages) {
            let weak = Arc::downgrade(&self.inner);
            registry.subscribe(messages, move |payload| {
                with_state(&weak, |state| state.on_room_event(payload))
            });
        }

        let typing = Topic::room_typing(chat_id);
        if !registry.contains(&typing) {
            let weak = Arc::downgrade(&self.inner);
            registry.subscribe(typing, move |payload| {
                with_state(&weak, |state| state.on_typing_event(payload))
            });
        }
    }

    fn on_room_event(&self, payload: Value) {
        match codec::decode_payload::<RoomEventPayload>(payload) {
            Ok(RoomEventPayload::Message(message)) => {
                self.handle_inbound_message(message.into());
            }
            Ok(RoomEventPayload::Read(receipt)) => self.handle_read_receipt(receipt),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed room event");
                metrics::record_dropped_frame("decode");
            }
        }
    }

    fn on_typing_event(&self, payload: Value) {
        match codec::decode_payload::<TypingPayload>(payload) {
            Ok(event) => self.handle_typing(&event.chat_id, &event.user_id, event.typing),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed typing event");
                metrics::record_dropped_frame("decode");
            }
        }
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn with_state(weak: &Weak<Inner>, f: impl FnOnce(&ConversationState)) {
    if let Some(inner) = weak.upgrade() {
        f(&ConversationState { inner });
    }
}

/// Append queued messages one at a time, in arrival order.
async fn write_behind(store: Arc<dyn MessageStore>, mut appends: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = appends.recv().await {
        if let Err(e) = store.append(&message).await {
            tracing::warn!(message_id = %message.id, error = %e, "Failed to persist message");
        }
    }
}

/// Spawn background work when a runtime is available.
fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::debug!("No runtime; background task skipped"),
    }
}
