//! # Domain Layer
//!
//! Chat domain types, independent of the transport.
//!
//! ## Structure
//!
//! - **entities**: Message, ConversationRoom, TypingSignal, MessageStore
//! - **value_objects**: identifiers, credential, topic naming

pub mod entities;
pub mod value_objects;

// Re-export commonly used types
pub use entities::*;
pub use value_objects::*;
