//! # Domain Entities
//!
//! Core objects of the realtime chat core.
//!
//! - **Message / OutgoingMessage**: delivered messages and local sends
//! - **ConversationRoom**: per-room buffer, unread accounting, typing set
//! - **TypingSignal**: ephemeral typing state with an expiry deadline
//!
//! The `MessageStore` trait defines the history collaborator contract;
//! implementations live in the infrastructure layer.

mod message;
mod room;
mod typing;

pub use message::{DeliveryState, Message, MessageStore, OutgoingMessage, Page};
#[cfg(test)]
pub use message::MockMessageStore;
pub use room::{ConversationRoom, InboundOutcome, RoomState, RoomSummary};
pub use typing::TypingSignal;
