//! Per-connection subscription registry.
//!
//! Remembers every `(topic, listener)` pair issued against one endpoint so
//! the connection can replay them after each reconnect. Entries are keyed by
//! a locally allocated [`SubscriptionKey`]: identity, not value, so the same
//! topic registered twice is two subscriptions. The server-assigned ids only
//! live as long as one socket and are kept in a separate route table.
//!
//! The registry is owned by the connection task; nothing else touches it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

/// Callback invoked with the `result` of every push for a subscription.
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Local identity of one registration. Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(pub u64);

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// What to subscribe to: the `eth_subscribe` kind plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub kind: String,
    pub params: Vec<Value>,
}

impl Topic {
    pub fn new(kind: impl Into<String>, params: Vec<Value>) -> Self {
        Self { kind: kind.into(), params }
    }

    /// `eth_subscribe("logs", filter)`.
    pub fn logs(filter: Value) -> Self {
        Self::new("logs", vec![filter])
    }

    /// Full `eth_subscribe` parameter list.
    pub fn subscribe_params(&self) -> Vec<Value> {
        std::iter::once(Value::String(self.kind.clone()))
            .chain(self.params.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.params.as_slice() {
            [] => write!(f, "{}", self.kind),
            params => write!(f, "{}{}", self.kind, Value::Array(params.to_vec())),
        }
    }
}

struct Entry {
    topic: Topic,
    listener: Listener,
}

/// Registered subscriptions plus the routes of the current socket.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionKey, Entry>,
    routes: HashMap<String, SubscriptionKey>,
    next_key: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a subscription. It will be replayed on every reconnect.
    pub fn insert(&mut self, topic: Topic, listener: Listener) -> SubscriptionKey {
        self.next_key += 1;
        let key = SubscriptionKey(self.next_key);
        self.entries.insert(key, Entry { topic, listener });
        key
    }

    pub fn topic(&self, key: SubscriptionKey) -> Option<&Topic> {
        self.entries.get(&key).map(|e| &e.topic)
    }

    /// Everything to replay, as `(key, topic)` pairs.
    pub fn replay_set(&self) -> Vec<(SubscriptionKey, Topic)> {
        self.entries
            .iter()
            .map(|(key, entry)| (*key, entry.topic.clone()))
            .collect()
    }

    /// Bind a server subscription id to a registration on the live socket.
    pub fn bind(&mut self, server_id: String, key: SubscriptionKey) {
        self.routes.insert(server_id, key);
    }

    /// Forget every server id. Called when the socket goes away.
    pub fn clear_routes(&mut self) {
        self.routes.clear();
    }

    /// Hand a push to its listener. Returns `false` for unknown server ids.
    pub fn dispatch(&self, server_id: &str, message: Value) -> bool {
        let Some(entry) = self
            .routes
            .get(server_id)
            .and_then(|key| self.entries.get(key))
        else {
            return false;
        };
        (entry.listener)(message);
        true
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of subscriptions bound on the current socket.
    pub fn bound(&self) -> usize {
        self.routes.len()
    }
}
