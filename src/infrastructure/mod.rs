//! Infrastructure Layer
//!
//! Contains implementations for external concerns:
//! - Physical transport (WebSocket)
//! - Message store (in-memory)
//! - Prometheus metrics

pub mod metrics;
pub mod store;
pub mod transport;
