//! Conversation room entity.
//!
//! A room owns its ordered message buffer, the dedup index over it, the
//! typing set and the outbox of local sends. Unread accounting lives here so
//! the rule is enforced in one place:
//!
//! - each distinct inbound message not written by the local user, received
//!   while the room is not active, adds exactly one unread
//! - only a mark-as-read resets the counter

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::message::{Message, OutgoingMessage};
use super::typing::TypingSignal;
use crate::domain::value_objects::{ChatId, MessageId, UserId};

/// Room lifecycle as seen by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Known but never opened
    #[default]
    Closed,
    /// Opened, waiting for the first history page
    Loading,
    /// The room the user is looking at
    Active,
    /// Opened earlier; still subscribed and buffering
    Background,
}

impl RoomState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Background => "background",
        }
    }
}

impl std::fmt::Display for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of feeding an inbound message to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Already buffered; dropped
    Duplicate,
    /// Appended to the buffer
    Appended { counted_unread: bool },
}

/// Room metadata as fetched from a room list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub chat_id: ChatId,
    pub participants: BTreeSet<UserId>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// A logical chat between two or more participants.
#[derive(Debug, Clone)]
pub struct ConversationRoom {
    pub chat_id: ChatId,
    pub participants: BTreeSet<UserId>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
    pub state: RoomState,

    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    typing: HashMap<UserId, TypingSignal>,
    outbox: Vec<OutgoingMessage>,
    read_markers: HashMap<UserId, DateTime<Utc>>,
    next_history_page: u32,
    history_exhausted: bool,
}

impl ConversationRoom {
    /// Create an empty, closed room.
    pub fn new(chat_id: ChatId, participants: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            chat_id,
            participants: participants.into_iter().collect(),
            last_message: None,
            unread_count: 0,
            updated_at: Utc::now(),
            state: RoomState::Closed,
            messages: Vec::new(),
            seen: HashSet::new(),
            typing: HashMap::new(),
            outbox: Vec::new(),
            read_markers: HashMap::new(),
            next_history_page: 0,
            history_exhausted: false,
        }
    }

    /// Hydrate a room from a room-list entry.
    pub fn from_summary(summary: RoomSummary) -> Self {
        let mut room = Self::new(summary.chat_id, summary.participants);
        room.last_message = summary.last_message;
        room.unread_count = summary.unread_count;
        room.updated_at = summary.updated_at;
        room
    }

    /// Metadata view of this room.
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            chat_id: self.chat_id.clone(),
            participants: self.participants.clone(),
            last_message: self.last_message.clone(),
            unread_count: self.unread_count,
            updated_at: self.updated_at,
        }
    }

    /// Buffered messages in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Feed an inbound message into the buffer.
    pub fn record_inbound(
        &mut self,
        message: Message,
        local_user: &UserId,
        room_is_active: bool,
    ) -> InboundOutcome {
        if !self.seen.insert(message.id.clone()) {
            return InboundOutcome::Duplicate;
        }

        self.outbox
            .retain(|outgoing| outgoing.server_id.as_ref() != Some(&message.id));
        self.typing.remove(&message.sender_id);
        self.participants.insert(message.sender_id.clone());

        let counted_unread = !room_is_active && !message.is_authored_by(local_user);
        if counted_unread {
            self.unread_count += 1;
        }

        self.updated_at = message.created_at;
        self.last_message = Some(message.clone());
        self.messages.push(message);

        InboundOutcome::Appended { counted_unread }
    }

    /// Insert an older history page ahead of the buffer.
    ///
    /// Messages already buffered are skipped. Unread counts are untouched:
    /// history is by definition not new traffic.
    pub fn prepend_history(&mut self, page: Vec<Message>) -> usize {
        let older: Vec<Message> = page
            .into_iter()
            .filter(|message| self.seen.insert(message.id.clone()))
            .collect();
        let inserted = older.len();

        if self.last_message.is_none() {
            self.last_message = older.last().cloned();
        }
        self.messages.splice(0..0, older);
        inserted
    }

    /// Reset unread count. Returns whether it changed.
    pub fn mark_read(&mut self) -> bool {
        let changed = self.unread_count != 0;
        self.unread_count = 0;
        changed
    }

    /// Move an active or loading room out of focus.
    pub fn move_to_background(&mut self) {
        if matches!(self.state, RoomState::Active | RoomState::Loading) {
            self.state = RoomState::Background;
        }
    }

    /// Record that a participant is typing until `signal.expires_at`.
    pub fn set_typing(&mut self, signal: TypingSignal) {
        self.typing.insert(signal.user_id.clone(), signal);
    }

    /// Remove a participant's typing signal. Returns whether one was present.
    pub fn clear_typing(&mut self, user_id: &UserId) -> bool {
        self.typing.remove(user_id).is_some()
    }

    /// Drop stale typing signals. Returns whether anything was removed.
    pub fn purge_expired_typing(&mut self, now: Instant) -> bool {
        let before = self.typing.len();
        self.typing.retain(|_, signal| !signal.is_stale(now));
        before != self.typing.len()
    }

    /// Users currently typing, never including stale signals.
    pub fn typing_users(&self, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .values()
            .filter(|signal| !signal.is_stale(now))
            .map(|signal| signal.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// Record a participant's read receipt.
    pub fn record_read(&mut self, user_id: UserId, read_at: DateTime<Utc>) {
        let marker = self.read_markers.entry(user_id).or_insert(read_at);
        if read_at > *marker {
            *marker = read_at;
        }
    }

    /// When a participant last read this room.
    pub fn read_marker(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.read_markers.get(user_id).copied()
    }

    pub fn outbox(&self) -> &[OutgoingMessage] {
        &self.outbox
    }

    pub fn push_outgoing(&mut self, outgoing: OutgoingMessage) {
        self.outbox.push(outgoing);
    }

    pub fn outgoing_mut(&mut self, local_id: Uuid) -> Option<&mut OutgoingMessage> {
        self.outbox
            .iter_mut()
            .find(|outgoing| outgoing.local_id == local_id)
    }

    /// Drop an outgoing entry whose authoritative copy is already buffered.
    pub fn retire_delivered(&mut self, local_id: Uuid) -> bool {
        let seen = &self.seen;
        let before = self.outbox.len();
        self.outbox.retain(|outgoing| {
            outgoing.local_id != local_id
                || !outgoing.server_id.as_ref().is_some_and(|id| seen.contains(id))
        });
        before != self.outbox.len()
    }

    /// Next history page to request, or `None` when history is exhausted.
    pub fn next_history_page(&self) -> Option<u32> {
        (!self.history_exhausted).then_some(self.next_history_page)
    }

    /// Advance the history cursor after a page was loaded.
    pub fn advance_history(&mut self, loaded_page: u32, has_more: bool) {
        self.next_history_page = loaded_page + 1;
        self.history_exhausted = !has_more;
    }
}
