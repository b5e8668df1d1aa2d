//! Realtime Error Types
//!
//! Centralized error taxonomy for the transport, routing and conversation layers.

/// Convenience alias used across the crate.
pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;

/// Realtime error type
///
/// Errors are `Clone` so a single in-flight connect result can be handed to
/// every caller awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Message store error: {0}")]
    Store(String),

    #[error("Unknown room: {0}")]
    UnknownRoom(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RealtimeError {
    /// Short, stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeError::Auth(_) => "auth",
            RealtimeError::Transport(_) => "transport",
            RealtimeError::NotConnected => "not_connected",
            RealtimeError::Decode(_) => "decode",
            RealtimeError::ReconnectExhausted { .. } => "reconnect_exhausted",
            RealtimeError::Timeout(_) => "timeout",
            RealtimeError::Rejected(_) => "rejected",
            RealtimeError::Cancelled => "cancelled",
            RealtimeError::Store(_) => "store",
            RealtimeError::UnknownRoom(_) => "unknown_room",
            RealtimeError::Config(_) => "config",
        }
    }

    /// Whether the session should schedule a reconnect after this failure.
    ///
    /// Credential rejections are final for the attempt: the caller must
    /// refresh the token before connecting again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport(_) | RealtimeError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Decode(err.to_string())
    }
}
