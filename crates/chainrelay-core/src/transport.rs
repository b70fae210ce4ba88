//! The `RpcClient` trait: request/response access to a streaming endpoint.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;

/// Endpoint health as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connected and usable.
    Healthy,
    /// Partially usable (e.g. some pool members down).
    Degraded,
    /// Not usable right now.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Anything that can carry JSON-RPC calls to a node.
///
/// Object-safe apart from [`call`](RpcClient::call), so it can be stored as
/// `Arc<dyn RpcClient>` where the typed helper is not needed.
#[async_trait]
pub trait RpcClient: Send + Sync + 'static {
    /// Send `method(params)` and return the raw `result` value.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError>;

    /// Current health of the underlying connection.
    fn health(&self) -> HealthStatus;

    /// Identifier of the endpoint (its URL).
    fn url(&self) -> &str;

    /// Convenience: call a method and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(TransportError::Deserialization)
    }
}
