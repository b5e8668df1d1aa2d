//! Wire-level topic and destination naming.
//!
//! These strings are a contract with the server and must stay bit-exact:
//!
//! ```text
//! /topic/chat.{chat_id}            room messages and read receipts
//! /topic/chat.{chat_id}.typing     room typing signals
//! /user/{user_id}/queue/messages   private queue for one user
//! /app/chat.send                   outbound message
//! /app/chat.typing                 outbound typing start
//! /app/chat.stopTyping             outbound typing stop
//! /app/chat.read                   outbound mark-as-read
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ChatId, UserId};

const ROOM_PREFIX: &str = "/topic/chat.";
const TYPING_SUFFIX: &str = ".typing";
const USER_PREFIX: &str = "/user/";
const USER_QUEUE_SUFFIX: &str = "/queue/messages";

/// A subscribable topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Wrap an arbitrary topic string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Per-room message topic.
    pub fn room_messages(chat_id: &ChatId) -> Self {
        Self(format!("{}{}", ROOM_PREFIX, chat_id))
    }

    /// Per-room typing topic.
    pub fn room_typing(chat_id: &ChatId) -> Self {
        Self(format!("{}{}{}", ROOM_PREFIX, chat_id, TYPING_SUFFIX))
    }

    /// Private queue of a single user.
    pub fn user_queue(user_id: &UserId) -> Self {
        Self(format!("{}{}{}", USER_PREFIX, user_id, USER_QUEUE_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Outbound action destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    SendMessage,
    Typing,
    StopTyping,
    MarkRead,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "/app/chat.send",
            Self::Typing => "/app/chat.typing",
            Self::StopTyping => "/app/chat.stopTyping",
            Self::MarkRead => "/app/chat.read",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
