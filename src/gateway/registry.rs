//! Subscription Registry
//!
//! Holds the topic → handler bindings that must survive reconnects. While
//! online, (un)subscribes go straight to the wire through the session link;
//! while offline they are recorded and replayed on the next connect.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::codec::Frame;
use super::session::SessionLink;
use crate::domain::Topic;

/// Topic payload handler. Runs on the session I/O task and must not block.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Token returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

struct Entry {
    topic: Topic,
    id: u64,
    handler: Handler,
    active: bool,
}

#[derive(Default)]
struct State {
    /// Registration order
    entries: Vec<Entry>,
    link: Option<SessionLink>,
    next_id: u64,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<State>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `topic`.
    ///
    /// Subscribing a topic that is already bound replaces the handler and
    /// keeps its position in the replay order; no second wire subscription
    /// is made.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionHandle
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let handler: Handler = Arc::new(handler);

        if let Some(entry) = state.entries.iter_mut().find(|e| e.topic == topic) {
            tracing::debug!(topic = %topic, "Replacing subscription handler");
            entry.handler = handler;
            entry.id = id;
            return SubscriptionHandle { topic, id };
        }

        let active = match &state.link {
            Some(link) => link.post(Frame::Subscribe {
                topic: topic.to_string(),
            }),
            None => false,
        };
        tracing::debug!(topic = %topic, online = active, "Subscribed");
        state.entries.push(Entry {
            topic: topic.clone(),
            id,
            handler,
            active,
        });
        SubscriptionHandle { topic, id }
    }

    /// Remove a binding. A handle that was replaced or already removed is a
    /// no-op.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state
            .entries
            .iter()
            .position(|e| e.topic == handle.topic && e.id == handle.id)
        else {
            return false;
        };
        Self::remove_at(&mut state, index);
        true
    }

    /// Remove whatever binding `topic` currently has.
    pub fn unsubscribe_topic(&self, topic: &Topic) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.entries.iter().position(|e| &e.topic == topic) else {
            return false;
        };
        Self::remove_at(&mut state, index);
        true
    }

    fn remove_at(state: &mut State, index: usize) {
        let entry = state.entries.remove(index);
        if let Some(link) = &state.link {
            link.post(Frame::Unsubscribe {
                topic: entry.topic.to_string(),
            });
        }
        tracing::debug!(topic = %entry.topic, "Unsubscribed");
    }

    /// Go online and snapshot the replay, in registration order.
    ///
    /// Bindings made after this call are posted through `link` and so queue
    /// behind the replay.
    pub fn go_online(&self, link: SessionLink) -> Vec<Frame> {
        let mut state = self.state.lock();
        state.link = Some(link);
        state
            .entries
            .iter_mut()
            .map(|entry| {
                entry.active = true;
                Frame::Subscribe {
                    topic: entry.topic.to_string(),
                }
            })
            .collect()
    }

    /// Mark every binding inactive. Bindings are retained for replay.
    pub fn go_offline(&self) {
        let mut state = self.state.lock();
        state.link = None;
        for entry in &mut state.entries {
            entry.active = false;
        }
    }

    /// Current handler for `topic`, cloned out of the lock.
    pub fn handler(&self, topic: &Topic) -> Option<Handler> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| &e.topic == topic)
            .map(|e| Arc::clone(&e.handler))
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.state.lock().entries.iter().any(|e| &e.topic == topic)
    }

    /// Whether `topic` is subscribed on the current connection.
    pub fn is_active(&self, topic: &Topic) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|e| &e.topic == topic && e.active)
    }

    /// Registered topics in registration order.
    pub fn topics(&self) -> Vec<Topic> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.topic.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
