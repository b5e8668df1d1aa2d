//! Typing signal entity.

use tokio::time::Instant;

use crate::domain::value_objects::{ChatId, UserId};

/// Ephemeral "user is typing" state for one room.
///
/// `expires_at` is a monotonic deadline; past it the signal is stale and
/// must not be reported even if no stop event ever arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub expires_at: Instant,
}

impl TypingSignal {
    pub fn new(chat_id: ChatId, user_id: UserId, expires_at: Instant) -> Self {
        Self {
            chat_id,
            user_id,
            expires_at,
        }
    }

    /// Check whether the signal has expired at `now`.
    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
