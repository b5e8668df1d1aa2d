//! Client Wiring
//!
//! Builds the realtime stack from settings and hands out its components.

use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use crate::application::{ConversationState, TypingDebouncer, TypingSignals};
use crate::config::Settings;
use crate::domain::{ChatId, Credential, MessageStore, UserId};
use crate::gateway::{Router, Session};
use crate::infrastructure::transport::{Connector, WebSocketConnector};
use crate::shared::error::{RealtimeError, Result};

/// Realtime chat client for one local user.
pub struct ChatClient {
    router: Arc<Router>,
    conversations: ConversationState,
    typing: TypingDebouncer,
    settings: Arc<Settings>,
}

impl ChatClient {
    /// Build the client over an arbitrary transport.
    pub fn build(
        settings: &Settings,
        local_user: UserId,
        connector: Arc<dyn Connector>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| RealtimeError::Config(e.to_string()))?;

        let router = Router::build(connector, settings.session_config());
        let conversations = ConversationState::new(
            local_user,
            Arc::clone(&router),
            store,
            settings.conversation_config(),
        );
        let signals: Arc<dyn TypingSignals> = router.clone();
        let typing = TypingDebouncer::new(signals, settings.typing_ttl());

        tracing::debug!(user = %conversations.local_user(), "Chat client built");

        Ok(Self {
            router,
            conversations,
            typing,
            settings: Arc::new(settings.clone()),
        })
    }

    /// Build the client over a WebSocket to `settings.realtime.url`.
    pub fn websocket(
        settings: &Settings,
        local_user: UserId,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let connector = WebSocketConnector::new(
            settings.realtime.url.clone(),
            settings.realtime.max_frame_size,
        );
        Self::build(settings, local_user, Arc::new(connector), store)
    }

    pub async fn connect(&self, credential: Credential) -> Result<()> {
        self.router.session().connect(credential).await
    }

    pub async fn disconnect(&self) {
        self.router.session().disconnect().await;
    }

    pub fn session(&self) -> &Session {
        self.router.session()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn conversations(&self) -> &ConversationState {
        &self.conversations
    }

    pub fn typing(&self) -> &TypingDebouncer {
        &self.typing
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Local keystroke in `chat_id`.
    pub async fn notify_typing(&self, chat_id: &ChatId) -> Result<()> {
        self.typing.notify_typing(chat_id).await
    }

    /// Send a message, closing any open typing window first.
    pub async fn send_message(&self, chat_id: &ChatId, body: impl Into<String>) -> Result<Uuid> {
        if let Err(e) = self.typing.stop_typing(chat_id).await {
            tracing::debug!(chat_id = %chat_id, error = %e, "Typing stop not delivered");
        }
        self.conversations.send_message(chat_id, body).await
    }
}
