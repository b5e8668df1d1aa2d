//! Message Router
//!
//! Inbound: topic frames are handed to the handler bound in the
//! [`SubscriptionRegistry`]. Outbound: chat actions are mapped to their fixed
//! destination and payload and sent through the [`Session`].

use std::sync::{Arc, Weak};

use serde::Serialize;
use serde_json::Value;

use super::codec::{self, ChatRefPayload, Frame, SendMessagePayload};
use super::registry::{SubscriptionHandle, SubscriptionRegistry};
use super::session::{Ack, Session, SessionConfig, SessionLink, SessionListener};
use crate::domain::{ChatId, Destination, Topic};
use crate::infrastructure::metrics;
use crate::infrastructure::transport::Connector;
use crate::shared::error::Result;

pub struct Router {
    session: Session,
    registry: Arc<SubscriptionRegistry>,
}

impl Router {
    /// Build a router together with the session it listens to.
    pub fn build(connector: Arc<dyn Connector>, config: SessionConfig) -> Arc<Self> {
        Self::with_registry(connector, config, Arc::new(SubscriptionRegistry::new()))
    }

    pub fn with_registry(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        registry: Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|router: &Weak<Router>| {
            let listener: Weak<dyn SessionListener> = router.clone();
            Router {
                session: Session::with_listener(connector, config, listener),
                registry,
            }
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionHandle
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.registry.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    /// Decode a raw frame and dispatch it. Undecodable input is logged and
    /// dropped.
    pub fn on_frame(&self, raw: &str) {
        match codec::decode(raw) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame");
                metrics::record_dropped_frame("decode");
            }
        }
    }

    /// Dispatch a decoded frame to its topic handler.
    pub fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Message { topic, payload } => {
                let topic = Topic::new(topic);
                match self.registry.handler(&topic) {
                    Some(handler) => handler(payload),
                    None => {
                        tracing::debug!(topic = %topic, "No handler for topic; dropping");
                        metrics::record_dropped_frame("no_handler");
                    }
                }
            }
            Frame::Error { message, .. } => {
                tracing::warn!(%message, "Server reported an error");
            }
            other => tracing::trace!(op = other.op_name(), "Ignoring frame"),
        }
    }

    pub async fn send_message(&self, chat_id: &ChatId, body: &str) -> Result<Ack> {
        let payload = SendMessagePayload {
            chat_id: chat_id.clone(),
            body: body.to_string(),
        };
        self.send(Destination::SendMessage, &payload).await
    }

    pub async fn send_typing(&self, chat_id: &ChatId) -> Result<Ack> {
        self.send(Destination::Typing, &chat_ref(chat_id)).await
    }

    pub async fn send_stop_typing(&self, chat_id: &ChatId) -> Result<Ack> {
        self.send(Destination::StopTyping, &chat_ref(chat_id)).await
    }

    pub async fn mark_read(&self, chat_id: &ChatId) -> Result<Ack> {
        self.send(Destination::MarkRead, &chat_ref(chat_id)).await
    }

    async fn send<P: Serialize>(&self, destination: Destination, payload: &P) -> Result<Ack> {
        let payload = serde_json::to_value(payload)?;
        self.session.send(destination.as_str(), payload).await
    }
}

fn chat_ref(chat_id: &ChatId) -> ChatRefPayload {
    ChatRefPayload {
        chat_id: chat_id.clone(),
    }
}

impl SessionListener for Router {
    fn on_connected(&self, link: &SessionLink) -> Vec<Frame> {
        self.registry.go_online(link.clone())
    }

    fn on_frame(&self, frame: Frame) {
        self.dispatch(frame);
    }

    fn on_disconnected(&self) {
        self.registry.go_offline();
    }
}
