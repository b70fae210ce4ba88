//! chainrelay-core: foundation types for ChainRelay.
//!
//! # Overview
//!
//! ChainRelay keeps contract-event subscriptions alive across a set of
//! redundant streaming RPC endpoints and forwards decoded events to a
//! webhook. The core crate defines what the other crates share:
//!
//! - [`TransportError`]: structured error type
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] / [`Incoming`]: wire types
//! - [`RpcClient`] / [`HealthStatus`]: request access to an endpoint
//! - [`policy`] module: backoff schedules and the bounded retry policy
//! - [`DomainEvent`]: what listeners publish and the webhook delivers
//! - [`EventBus`]: topic-keyed publish/subscribe decoupling the two

pub mod bus;
pub mod error;
pub mod event;
pub mod policy;
pub mod request;
pub mod transport;

pub use bus::{EventBus, EventHandler};
pub use error::TransportError;
pub use event::{DomainEvent, TRANSACTIONS_TOPIC};
pub use policy::{Backoff, RetryPolicy};
pub use request::{Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionParams};
pub use transport::{HealthStatus, RpcClient};
