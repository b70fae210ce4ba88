//! Retry policy shared by reconnect loops and webhook delivery.

pub mod retry;

pub use retry::{Backoff, RetryPolicy};
