//! Message entity and message store trait.
//!
//! Delivered messages carry a server-assigned id. Messages the local user is
//! still sending live in the room outbox as [`OutgoingMessage`] until the
//! authoritative copy arrives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::value_objects::{ChatId, MessageId, UserId};
use crate::shared::error::RealtimeError;

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Local send in flight
    #[default]
    Pending,
    /// Acknowledged by the transport, or received from the server
    Sent,
    /// Send attempt failed; the caller may retry
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A chat message as held in a room buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned ID (dedup key)
    pub id: MessageId,

    /// Room the message belongs to
    pub chat_id: ChatId,

    /// Author
    pub sender_id: UserId,

    /// Message text
    pub body: String,

    /// Server timestamp
    pub created_at: DateTime<Utc>,

    pub delivery_state: DeliveryState,
}

impl Message {
    /// Build a delivered message.
    pub fn new(
        id: impl Into<MessageId>,
        chat_id: impl Into<ChatId>,
        sender_id: impl Into<UserId>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            body: body.into(),
            created_at,
            delivery_state: DeliveryState::Sent,
        }
    }

    /// Check whether the given user wrote this message.
    pub fn is_authored_by(&self, user_id: &UserId) -> bool {
        self.sender_id == *user_id
    }
}

/// A message the local user is sending.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Client-local ID, stable across retries
    pub local_id: Uuid,

    pub chat_id: ChatId,

    pub body: String,

    /// When the send was first attempted
    pub created_at: DateTime<Utc>,

    pub state: DeliveryState,

    /// ID assigned by the server once the send is acknowledged
    pub server_id: Option<MessageId>,

    /// Last failure, kept for display while the message is Failed
    pub last_error: Option<String>,

    /// Number of send attempts made so far
    pub attempts: u32,
}

impl OutgoingMessage {
    /// Create a pending outgoing message.
    pub fn new(chat_id: ChatId, body: impl Into<String>) -> Self {
        Self {
            local_id: Uuid::now_v7(),
            chat_id,
            body: body.into(),
            created_at: Utc::now(),
            state: DeliveryState::Pending,
            server_id: None,
            last_error: None,
            attempts: 0,
        }
    }

    /// Record a new send attempt.
    pub fn begin_attempt(&mut self) {
        self.state = DeliveryState::Pending;
        self.last_error = None;
        self.attempts += 1;
    }

    /// Mark as acknowledged by the transport.
    pub fn mark_sent(&mut self, server_id: Option<MessageId>) {
        self.state = DeliveryState::Sent;
        self.last_error = None;
        if server_id.is_some() {
            self.server_id = server_id;
        }
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: &RealtimeError) {
        self.state = DeliveryState::Failed;
        self.last_error = Some(error.to_string());
    }
}

/// A page of results from the message store.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items in chronological order (oldest first)
    pub items: Vec<T>,

    /// Zero-based page number; page 0 is the newest
    pub page: u32,

    pub size: u32,

    /// Whether older pages exist
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty(page: u32, size: u32) -> Self {
        Self {
            items: Vec::new(),
            page,
            size,
            has_more: false,
        }
    }
}

/// External message history collaborator.
///
/// Consumed by conversation state; implementations live outside the core
/// (an in-memory one ships in `infrastructure::store`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch one page of history. Page 0 holds the newest messages; each
    /// page is returned oldest first.
    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        page: u32,
        size: u32,
    ) -> Result<Page<Message>, RealtimeError>;

    /// Persist a delivered message.
    async fn append(&self, message: &Message) -> Result<(), RealtimeError>;
}
