//! Typing Debouncer
//!
//! Bounds outbound typing traffic: at most one typing-start per chat per TTL
//! window however often the user types, and one typing-stop once activity
//! has ceased for a full TTL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{sleep_until, Instant};

use crate::domain::ChatId;
use crate::gateway::Router;
use crate::shared::error::Result;

/// Outbound typing actions.
#[async_trait]
pub trait TypingSignals: Send + Sync {
    async fn send_typing(&self, chat_id: &ChatId) -> Result<()>;
    async fn send_stop_typing(&self, chat_id: &ChatId) -> Result<()>;
}

#[async_trait]
impl TypingSignals for Router {
    async fn send_typing(&self, chat_id: &ChatId) -> Result<()> {
        Router::send_typing(self, chat_id).await.map(|_| ())
    }

    async fn send_stop_typing(&self, chat_id: &ChatId) -> Result<()> {
        Router::send_stop_typing(self, chat_id).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy)]
struct TypingWindow {
    /// When the last typing-start went out
    started_at: Instant,
    /// Stop is due at this instant unless activity pushes it back
    deadline: Instant,
    /// Identifies the expiry task that owns this window
    generation: u64,
}

struct Inner {
    signals: Arc<dyn TypingSignals>,
    ttl: Duration,
    windows: DashMap<ChatId, TypingWindow>,
    next_generation: AtomicU64,
}

/// Typing debouncer service
#[derive(Clone)]
pub struct TypingDebouncer {
    inner: Arc<Inner>,
}

impl TypingDebouncer {
    pub fn new(signals: Arc<dyn TypingSignals>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                signals,
                ttl,
                windows: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Whether a typing window is open for `chat_id`.
    pub fn is_typing(&self, chat_id: &ChatId) -> bool {
        self.inner.windows.contains_key(chat_id)
    }

    /// Record local typing activity in `chat_id`.
    ///
    /// Sends typing-start only if none went out within the TTL, and pushes
    /// the stop deadline to now + TTL.
    pub async fn notify_typing(&self, chat_id: &ChatId) -> Result<()> {
        let now = Instant::now();
        let ttl = self.inner.ttl;
        let deadline = now + ttl;

        // (generation, start to restore) when a typing-start must go out
        let (start, new_window) = match self.inner.windows.entry(chat_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                window.deadline = deadline;
                if now.duration_since(window.started_at) >= ttl {
                    let previous = std::mem::replace(&mut window.started_at, now);
                    (Some((window.generation, Some(previous))), false)
                } else {
                    (None, false)
                }
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                vacant.insert(TypingWindow {
                    started_at: now,
                    deadline,
                    generation,
                });
                (Some((generation, None)), true)
            }
        };

        let Some((generation, previous)) = start else {
            return Ok(());
        };
        if new_window {
            tokio::spawn(expire(Arc::clone(&self.inner), chat_id.clone(), generation));
        }
        tracing::trace!(chat_id = %chat_id, "Sending typing start");
        if let Err(e) = self.inner.signals.send_typing(chat_id).await {
            self.rollback(chat_id, generation, now, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Undo a typing-start that never reached the server. A fresh window is
    /// dropped so no stop follows it; a refreshed one retries on the next
    /// keystroke.
    fn rollback(&self, chat_id: &ChatId, generation: u64, started_at: Instant, previous: Option<Instant>) {
        match previous {
            None => {
                self.inner
                    .windows
                    .remove_if(chat_id, |_, window| window.generation == generation);
            }
            Some(previous) => {
                if let Some(mut window) = self.inner.windows.get_mut(chat_id) {
                    if window.generation == generation && window.started_at == started_at {
                        window.started_at = previous;
                    }
                }
            }
        }
        tracing::debug!(chat_id = %chat_id, "Typing start failed; window rolled back");
    }

    /// Close the typing window now, e.g. because the message was sent.
    pub async fn stop_typing(&self, chat_id: &ChatId) -> Result<()> {
        if self.inner.windows.remove(chat_id).is_some() {
            self.inner.signals.send_stop_typing(chat_id).await?;
        }
        Ok(())
    }
}

async fn expire(inner: Arc<Inner>, chat_id: ChatId, generation: u64) {
    loop {
        let deadline = match inner.windows.get(&chat_id) {
            Some(window) if window.generation == generation => window.deadline,
            _ => return,
        };
        sleep_until(deadline).await;

        let now = Instant::now();
        let expired = inner
            .windows
            .remove_if(&chat_id, |_, window| {
                window.generation == generation && window.deadline <= now
            })
            .is_some();
        if expired {
            tracing::trace!(chat_id = %chat_id, "Typing window expired");
            if let Err(e) = inner.signals.send_stop_typing(&chat_id).await {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send typing stop");
            }
            return;
        }
    }
}
