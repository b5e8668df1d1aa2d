//! Wire Codec
//!
//! Frames are JSON text messages, adjacently tagged:
//!
//! ```text
//! {"op":"SUBSCRIBE","d":{"topic":"/topic/chat.42"}}
//! {"op":"SEND","d":{"destination":"/app/chat.send","receipt":7,"payload":{"chatId":"42","body":"hi"}}}
//! {"op":"RECEIPT","d":{"receipt":7,"messageId":"m-981"}}
//! {"op":"HEARTBEAT"}
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ChatId, Message, MessageId, UserId};
use crate::shared::error::{RealtimeError, Result};

/// Transport frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Client → server: start receiving a topic
    Subscribe { topic: String },

    /// Client → server: stop receiving a topic
    Unsubscribe { topic: String },

    /// Client → server: deliver a payload to a destination
    Send {
        destination: String,
        receipt: u64,
        payload: Value,
    },

    /// Server → client: payload published on a topic
    Message { topic: String, payload: Value },

    /// Server → client: acknowledgement of a `Send`
    Receipt {
        receipt: u64,
        #[serde(
            rename = "messageId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        message_id: Option<MessageId>,
    },

    /// Server → client: a `Send` (or the session) was rejected
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt: Option<u64>,
        message: String,
    },

    /// Keepalive, both directions
    Heartbeat,
}

impl Frame {
    /// Frame name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Frame::Subscribe { .. } => "SUBSCRIBE",
            Frame::Unsubscribe { .. } => "UNSUBSCRIBE",
            Frame::Send { .. } => "SEND",
            Frame::Message { .. } => "MESSAGE",
            Frame::Receipt { .. } => "RECEIPT",
            Frame::Error { .. } => "ERROR",
            Frame::Heartbeat => "HEARTBEAT",
        }
    }
}

/// Serialize a frame to its text form.
pub fn encode(frame: &Frame) -> Result<String> {
    serde_json::to_string(frame).map_err(|e| RealtimeError::Decode(format!("encode failed: {}", e)))
}

/// Parse a text frame.
pub fn decode(raw: &str) -> Result<Frame> {
    Ok(serde_json::from_str(raw)?)
}

/// Decode a topic payload into a typed event.
pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

// Outbound action payloads

/// `/app/chat.send` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub chat_id: ChatId,
    pub body: String,
}

/// Payload of typing, stop-typing and mark-read actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRefPayload {
    pub chat_id: ChatId,
}

// Inbound topic payloads

/// Event published on a room topic or a user queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomEventPayload {
    Message(MessagePayload),
    Read(ReadReceiptPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Message::new(
            payload.id,
            payload.chat_id,
            payload.sender_id,
            payload.body,
            payload.created_at,
        )
    }
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// Event published on a room typing topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub typing: bool,
}
