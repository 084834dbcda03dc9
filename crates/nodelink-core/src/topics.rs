//! Local topic listeners.
//!
//! Registration is rare and dispatch is hot, so each topic maps to an
//! immutable `Arc<Vec<_>>` that is swapped wholesale on registration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::constants::fields;
use crate::guard::call_listener;

/// Receives topic messages delivered to this process.
pub trait TopicListener: Send + Sync {
    /// Called once per delivered message, with the `topic` key removed from `payload`.
    fn on_topic_message(&self, topic: &str, payload: &Map<String, Value>);
}

impl<F> TopicListener for F
where
    F: Fn(&str, &Map<String, Value>) + Send + Sync,
{
    fn on_topic_message(&self, topic: &str, payload: &Map<String, Value>) {
        self(topic, payload);
    }
}

type ListenerList = Arc<Vec<Arc<dyn TopicListener>>>;

/// Topic name to listener list.
#[derive(Default)]
pub struct TopicListeners {
    by_topic: RwLock<HashMap<String, ListenerList>>,
}

impl TopicListeners {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for every topic in `topics`.
    ///
    /// Returns the full, sorted set of topics with at least one listener.
    pub fn register<I, T>(&self, topics: I, listener: &Arc<dyn TopicListener>) -> Vec<String>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut map = self.by_topic.write();
        for topic in topics {
            let topic = topic.into();
            let mut next: Vec<_> = map
                .get(&topic)
                .map(|list| list.as_ref().clone())
                .unwrap_or_default();
            next.push(Arc::clone(listener));
            let _ = map.insert(topic, Arc::new(next));
        }
        let mut all: Vec<String> = map.keys().cloned().collect();
        all.sort_unstable();
        all
    }

    /// Sorted topics with at least one listener.
    pub fn topics(&self) -> Vec<String> {
        let mut all: Vec<String> = self.by_topic.read().keys().cloned().collect();
        all.sort_unstable();
        all
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.by_topic.read().is_empty()
    }

    /// Snapshot of the listeners for `topic`.
    pub fn listeners_for(&self, topic: &str) -> ListenerList {
        self.by_topic.read().get(topic).cloned().unwrap_or_default()
    }

    /// Deliver `payload` to every listener of `topic`.
    ///
    /// The `topic` key is stripped before delivery. A panicking listener is
    /// logged and skipped. Returns how many listeners were called.
    pub fn dispatch(&self, topic: &str, payload: &Map<String, Value>) -> usize {
        let listeners = self.listeners_for(topic);
        if listeners.is_empty() {
            return 0;
        }
        let mut stripped = payload.clone();
        let _ = stripped.remove(fields::TOPIC);
        for listener in listeners.iter() {
            let _ = call_listener("topic", || listener.on_topic_message(topic, &stripped));
        }
        debug!(topic, listeners = listeners.len(), "topic message dispatched locally");
        listeners.len()
    }
}
