//! TTL'd "things worth keeping fresh" set (spec.md §4.B), grouped per
//! `(endpoint, transport)`. Written by `Endpoint::register_request`, read by
//! `BackgroundExecutor` to decide what to refresh.

mod local;
mod remote;

pub use local::LocalSubscriptionSet;
pub use remote::RemoteSubscriptionSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(rename = "expireAtUnixMs")]
    pub expire_at_unix_ms: i64,
}

impl SubscriptionEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expire_at_unix_ms
    }
}

/// Contract shared by the local (in-process) and remote (redis sorted-set)
/// implementations. `add` is idempotent per key: re-adding refreshes the TTL
/// and (for the local variant) moves the entry to most-recently-used.
#[async_trait]
pub trait SubscriptionSet: Send + Sync {
    async fn add(&self, key: &str, value: serde_json::Value, ttl_ms: u64) -> Result<(), AdapterError>;

    /// Ground truth consulted by background-execute: filters out anything
    /// whose TTL has elapsed before returning.
    async fn get_all(&self) -> Result<Vec<SubscriptionEntry>, AdapterError>;
}

/// Builds a fresh `SubscriptionSet` per `(endpoint, transport)` pair,
/// wired to whichever backend the adapter's cache type selected (spec.md
/// §3 "Ownership": each transport owns its own subscription set instance).
pub enum SubscriptionSetFactory {
    Local { max_items: u64 },
    Remote { redis_url: String },
}

impl SubscriptionSetFactory {
    pub async fn build(&self, adapter: &str, endpoint: &str, transport: &str) -> anyhow::Result<std::sync::Arc<dyn SubscriptionSet>> {
        match self {
            SubscriptionSetFactory::Local { max_items } => Ok(std::sync::Arc::new(LocalSubscriptionSet::new(*max_items))),
            SubscriptionSetFactory::Remote { redis_url } => {
                // spec.md §6 persisted state layout: subscription-set keys carry
                // no CACHE_PREFIX, unlike cache entries and the writer lock.
                let key = format!("{adapter}-{endpoint}-{transport}-subscriptionSet");
                Ok(std::sync::Arc::new(RemoteSubscriptionSet::connect(redis_url, key).await?))
            }
        }
    }
}
