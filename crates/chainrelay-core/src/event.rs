//! Application-level events decoded from contract logs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Bus topic carrying every [`DomainEvent`].
pub const TRANSACTIONS_TOPIC: &str = "chain.transactions";

/// A decoded, application-level occurrence. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    CheckIn { user_id: String },
    PurchaseItem { user_id: String, item_id: u64 },
}

impl DomainEvent {
    /// Sub-path under the webhook base URL.
    pub fn route(&self) -> &'static str {
        match self {
            Self::CheckIn { .. } => "check-in",
            Self::PurchaseItem { .. } => "purchase-item",
        }
    }

    /// JSON body posted to [`route`](Self::route).
    pub fn webhook_body(&self) -> Value {
        match self {
            Self::CheckIn { user_id } => json!({ "account_id": user_id }),
            Self::PurchaseItem { user_id, item_id } => json!({
                "account_id": user_id,
                "item_id": item_id,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::CheckIn { user_id } | Self::PurchaseItem { user_id, .. } => user_id,
        }
    }
}

impl std::fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CheckIn { user_id } => write!(f, "check-in(user={user_id})"),
            Self::PurchaseItem { user_id, item_id } => {
                write!(f, "purchase-item(user={user_id}, item={item_id})")
            }
        }
    }
}
