//! # Realtime Gateway
//!
//! Client side of the pub/sub channel.
//!
//! ## Components
//!
//! - **codec**: wire frames and topic payloads
//! - **session**: connection lifecycle, heartbeats, reconnect with backoff
//! - **registry**: topic subscriptions, replayed on every connect
//! - **router**: inbound dispatch and outbound chat actions

pub mod backoff;
pub mod codec;
pub mod registry;
pub mod router;
pub mod session;

pub use backoff::Backoff;
pub use codec::Frame;
pub use registry::{Handler, SubscriptionHandle, SubscriptionRegistry};
pub use router::Router;
pub use session::{
    Ack, DisconnectReason, Session, SessionConfig, SessionEvent, SessionLink, SessionListener,
    SessionState,
};
