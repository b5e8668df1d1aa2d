//! Conversation change notifications.
//!
//! Broadcast by [`ConversationState`](super::ConversationState) so a UI can
//! re-render without polling.

use uuid::Uuid;

use crate::domain::{ChatId, DeliveryState, MessageId, RoomState, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Room metadata changed (participants, last message)
    RoomUpdated { chat_id: ChatId },

    RoomStateChanged { chat_id: ChatId, state: RoomState },

    MessageAppended { chat_id: ChatId, message_id: MessageId },

    /// Older messages were inserted ahead of the buffer
    HistoryLoaded { chat_id: ChatId, inserted: usize, has_more: bool },

    UnreadChanged { chat_id: ChatId, unread_count: u32 },

    OutgoingChanged {
        chat_id: ChatId,
        local_id: Uuid,
        state: DeliveryState,
    },

    TypingChanged { chat_id: ChatId, users: Vec<UserId> },

    /// Another participant read the room
    ReadReceipt { chat_id: ChatId, user_id: UserId },
}
