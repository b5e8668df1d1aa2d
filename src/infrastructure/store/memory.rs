//! In-memory message store.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{ChatId, Message, MessageStore, Page};
use crate::shared::error::RealtimeError;

/// Keeps every room's history in chronological order.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    rooms: DashMap<ChatId, Vec<Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with history, oldest first.
    pub fn with_history(self, chat_id: ChatId, messages: impl IntoIterator<Item = Message>) -> Self {
        self.rooms.entry(chat_id).or_default().extend(messages);
        self
    }

    pub fn history_len(&self, chat_id: &ChatId) -> usize {
        self.rooms.get(chat_id).map_or(0, |history| history.len())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        page: u32,
        size: u32,
    ) -> Result<Page<Message>, RealtimeError> {
        if size == 0 {
            return Err(RealtimeError::Store("page size must be positive".into()));
        }
        let Some(history) = self.rooms.get(chat_id) else {
            return Ok(Page::empty(page, size));
        };

        // Page 0 is the newest slice
        let skip = (page as usize).saturating_mul(size as usize);
        let end = history.len().saturating_sub(skip);
        let start = end.saturating_sub(size as usize);

        Ok(Page {
            items: history[start..end].to_vec(),
            page,
            size,
            has_more: start > 0,
        })
    }

    async fn append(&self, message: &Message) -> Result<(), RealtimeError> {
        let mut history = self.rooms.entry(message.chat_id.clone()).or_default();
        if !history.iter().any(|existing| existing.id == message.id) {
            history.push(message.clone());
        }
        Ok(())
    }
}
