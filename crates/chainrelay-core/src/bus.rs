//! In-process publish/subscribe keyed by topic name.
//!
//! Each topic is a `tokio::sync::broadcast` channel. Every subscriber gets
//! its own receiver drained by its own task, so a slow handler only ever
//! lags itself: publication never waits on it. A subscriber that falls more
//! than `capacity` events behind loses the oldest ones and logs the gap.
//!
//! ```text
//! publisher ──publish(topic)──▶ broadcast::Sender ──┬──▶ task ─▶ handler A
//!                                                   └──▶ task ─▶ handler B
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Consumer side of a bus topic.
#[async_trait]
pub trait EventHandler<T>: Send + Sync + 'static {
    /// Called once per published event, in publication order.
    async fn handle(&self, event: T);
}

/// A constructed (not global) publish/subscribe hub.
pub struct EventBus<T> {
    topics: RwLock<HashMap<String, broadcast::Sender<T>>>,
    capacity: usize,
}

impl<T> EventBus<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `capacity` is the per-topic backlog a subscriber may fall behind by.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Fire-and-forget publication. Returns how many subscribers will see it.
    pub fn publish(&self, topic: &str, event: T) -> usize {
        match self.sender(topic).send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(topic, "published with no subscribers");
                0
            }
        }
    }

    /// Run `handler` on its own task for every event published on `topic`
    /// from now on.
    pub fn subscribe<H>(&self, topic: &str, handler: H) -> JoinHandle<()>
    where
        H: EventHandler<T>,
    {
        let mut rx = self.sender(topic).subscribe();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler.handle(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(topic = %topic, "subscriber finished");
        })
    }

    /// Raw receiver for callers that want to drive consumption themselves.
    pub fn receiver(&self, topic: &str) -> broadcast::Receiver<T> {
        self.sender(topic).subscribe()
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<T> {
        if let Some(tx) = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
        {
            return tx.clone();
        }
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}
