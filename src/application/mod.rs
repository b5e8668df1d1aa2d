//! Application Layer
//!
//! Client-side chat services built on the gateway: conversation state and
//! typing debounce, plus the change notifications they broadcast.

pub mod events;
pub mod services;

pub use events::ConversationEvent;
pub use services::{ConversationConfig, ConversationState, TypingDebouncer, TypingSignals};
