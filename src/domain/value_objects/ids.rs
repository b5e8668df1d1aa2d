//! Identifier value objects.
//!
//! Chat, user and message identifiers are opaque strings assigned by the
//! backend. They are wrapped in distinct types so a user id can never be
//! passed where a chat id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from its raw string value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the raw string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Unique identifier of a conversation room.
    ChatId
);

string_id!(
    /// Unique identifier of a user.
    UserId
);

string_id!(
    /// Server-assigned message identifier.
    MessageId
);

/// Prefix of deterministic private-chat identifiers.
pub const PRIVATE_CHAT_PREFIX: &str = "private";

impl ChatId {
    /// Identifier of the private chat between two users.
    ///
    /// Participants are ordered before joining, so `(a, b)` and `(b, a)`
    /// always resolve to the same chat.
    pub fn private(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}:{}:{}", PRIVATE_CHAT_PREFIX, low, high))
    }
}
