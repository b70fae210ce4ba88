//! chainrelay-ws: resilient streaming JSON-RPC connections.
//!
//! # Features
//! - One state machine per endpoint with a bounded reconnect budget
//! - Ping/pong heartbeat with a pong deadline
//! - Subscriptions replayed on every reconnect
//! - Failover pool broadcasting the new active connection to its consumers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chainrelay_ws::{ConnectionPool, Endpoint, PoolConfig, Topic, TungsteniteConnector};
//!
//! # async fn run() -> Result<(), chainrelay_core::TransportError> {
//! let pool = ConnectionPool::connect(
//!     vec![Endpoint::new("wss://a.example"), Endpoint::new("wss://b.example")],
//!     PoolConfig::default(),
//!     Arc::new(TungsteniteConnector),
//! )
//! .await?;
//! let conn = pool.current(|next| tracing::info!(url = %next.endpoint().url, "swapped")).await?;
//! conn.subscribe(Topic::new("newHeads", vec![]), Arc::new(|head: serde_json::Value| println!("{head}")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod pool;
pub mod subscriptions;
pub mod transport;

pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionState, Endpoint, EndpointConnection,
    TerminationHook,
};
pub use pool::{ConnectionPool, PoolConfig, SwapCallback};
pub use subscriptions::{Listener, SubscriptionKey, SubscriptionRegistry, Topic};
pub use transport::{Connector, Frame, FrameSink, FrameStream, Socket, TungsteniteConnector};
