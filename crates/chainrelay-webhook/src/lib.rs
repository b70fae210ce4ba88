//! chainrelay-webhook: at-least-once delivery of domain events to an HTTP
//! webhook.
//!
//! - `POST {base_url}/check-in {account_id}`
//! - `POST {base_url}/purchase-item {account_id, item_id}`
//!
//! Any transport error or non-2xx status is retried with exponential backoff
//! (1s, 2s, 4s, ... by default) up to a fixed retry count, then dropped.

pub mod dispatcher;
pub mod sink;

pub use dispatcher::{
    DeliveryAttempt, DeliveryOutcome, DeliveryStats, DispatcherConfig, WebhookDispatcher,
};
pub use sink::{HttpSink, WebhookSink};
