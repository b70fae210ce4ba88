//! Event → webhook delivery with bounded exponential retry.
//!
//! Each event is delivered on its own task. One event's attempts are strictly
//! sequential: the next one starts only after the previous response (or
//! error) is known and the backoff delay has elapsed. After the last retry
//! fails the event is logged and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chainrelay_core::{DomainEvent, EventHandler, RetryPolicy};

use crate::sink::WebhookSink;

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// `None` (or empty) turns every delivery into a no-op.
    pub base_url: Option<String>,
    pub retry: RetryPolicy,
}

/// One event on its way to one URL.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub event: DomainEvent,
    pub target_url: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Every attempt failed; the event was dropped.
    Exhausted { attempts: u32 },
    /// No webhook URL configured.
    Disabled,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub retries: u64,
    pub exhausted: u64,
}

struct Inner {
    config: DispatcherConfig,
    sink: Arc<dyn WebhookSink>,
    stats: Counters,
}

/// Delivers [`DomainEvent`]s to `{base_url}/{route}`. Cheap to clone.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    pub fn new(config: DispatcherConfig, sink: Arc<dyn WebhookSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                stats: Counters::default(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url().is_some()
    }

    /// Full URL `event` is posted to, if delivery is enabled.
    pub fn target_url(&self, event: &DomainEvent) -> Option<String> {
        self.base_url()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), event.route()))
    }

    /// Deliver one event, retrying until it succeeds or the budget is spent.
    pub async fn deliver(&self, event: DomainEvent) -> DeliveryOutcome {
        let Some(target_url) = self.target_url(&event) else {
            debug!(event = %event, "webhook disabled, skipping delivery");
            return DeliveryOutcome::Disabled;
        };
        let body = event.webhook_body();
        let mut attempt = DeliveryAttempt { event, target_url, retry_count: 0 };
        let stats = &self.inner.stats;

        loop {
            let result = self.inner.sink.post(&attempt.target_url, &body).await;
            let attempts = attempt.retry_count + 1;
            let err = match result {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        url = %attempt.target_url,
                        event = %attempt.event,
                        attempts,
                        "webhook delivered"
                    );
                    return DeliveryOutcome::Delivered { attempts };
                }
                Err(e) => e,
            };

            match self.inner.config.retry.next_delay(attempt.retry_count) {
                Some(delay) => {
                    warn!(
                        url = %attempt.target_url,
                        event = %attempt.event,
                        retry_count = attempt.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        transient = err.is_retryable(),
                        error = %err,
                        "webhook delivery failed, retrying"
                    );
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt.retry_count += 1;
                }
                None => {
                    error!(
                        url = %attempt.target_url,
                        event = %attempt.event,
                        attempts,
                        max_attempts = self.inner.config.retry.max_attempts(),
                        error = %err,
                        "webhook retries exhausted, dropping event"
                    );
                    stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    return DeliveryOutcome::Exhausted { attempts };
                }
            }
        }
    }

    /// Deliver on a new task so other events are not held up.
    pub fn spawn_delivery(&self, event: DomainEvent) -> JoinHandle<DeliveryOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.deliver(event).await })
    }

    pub fn stats(&self) -> DeliveryStats {
        let stats = &self.inner.stats;
        DeliveryStats {
            delivered: stats.delivered.load(Ordering::Relaxed),
            retries: stats.retries.load(Ordering::Relaxed),
            exhausted: stats.exhausted.load(Ordering::Relaxed),
        }
    }

    fn base_url(&self) -> Option<&str> {
        self.inner
            .config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[async_trait]
impl EventHandler<DomainEvent> for WebhookDispatcher {
    async fn handle(&self, event: DomainEvent) {
        self.spawn_delivery(event);
    }
}
