//! # Chat Realtime Library
//!
//! This crate provides the client side of a real-time chat channel:
//! - A WebSocket session with heartbeats and exponential-backoff reconnect
//! - Topic subscriptions that are replayed after every reconnect
//! - Routing of inbound topic frames and outbound chat actions
//! - Conversation state: rooms, dedup, unread accounting, typing indicators
//!
//! ## Architecture
//!
//! - **Domain Layer**: identifiers, messages, rooms, the message store trait
//! - **Gateway Layer**: codec, session, subscription registry, router
//! - **Application Layer**: conversation state and typing debounce services
//! - **Infrastructure Layer**: WebSocket transport, in-memory store, metrics
//!
//! ## Module Structure
//!
//! ```text
//! chat_realtime/
//! +-- config/         Configuration management
//! +-- domain/         Entities and value objects
//! +-- gateway/        Wire codec, session, registry, router
//! +-- application/    Conversation and typing services
//! +-- infrastructure/ Transport, message store, metrics
//! +-- shared/         Error types
//! ```

// Configuration module
pub mod config;

// Domain layer
pub mod domain;

// Realtime gateway
pub mod gateway;

// Application layer - client services
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Shared utilities
pub mod shared;

// Client wiring
pub mod client;

// Telemetry and observability
pub mod telemetry;

pub use client::ChatClient;
pub use shared::error::{RealtimeError, Result};
