//! Application Services
//!
//! ## Available Services
//!
//! - **ConversationState**: rooms, buffers, unread accounting, remote typing
//! - **TypingDebouncer**: throttles the local user's typing signals

pub mod conversation;
pub mod typing;

pub use conversation::{ConversationConfig, ConversationState};
pub use typing::{TypingDebouncer, TypingSignals};
