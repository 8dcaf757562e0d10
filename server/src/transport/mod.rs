//! Transport contract (spec.md §4.E) plus the three built-in shapes.

pub mod http;
pub mod sse;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::ResponseCache;
use crate::error::AdapterError;
use crate::requester::{HttpRequest, ProviderResponse, Requester};
use crate::subscription::SubscriptionSet;

/// Everything a transport needs, handed to it once at `Adapter::initialize`
/// time and borrowed for the lifetime of the process (spec.md §3
/// "Transports borrow the Cache via a wrapper (ResponseCache) scoped to
/// (adapter, endpoint, transport)").
pub struct TransportDeps {
    pub cache: ResponseCache,
    pub subscriptions: Arc<dyn SubscriptionSet>,
    pub requester: Arc<Requester>,
    pub adapter_name: String,
    pub endpoint_name: String,
    pub transport_name: String,
    pub max_common_key_size: usize,
}

impl TransportDeps {
    /// Derives this transport's cache key for a given request shape,
    /// folding in `(adapter, endpoint, transport)` per spec.md §3.
    pub fn cache_key_for(&self, data: &serde_json::Value) -> String {
        crate::cache::derive_cache_key(
            &crate::cache::FingerprintInput {
                adapter_name: &self.adapter_name,
                endpoint_name: &self.endpoint_name,
                transport_name: &self.transport_name,
                data,
                selected_settings: &serde_json::Value::Null,
            },
            self.max_common_key_size,
        )
    }
}

/// A single result a transport produced (from an HTTP batch, a WS push, or
/// an SSE event) ready to be written into the cache.
pub struct TransportResult {
    pub params: serde_json::Value,
    pub value: serde_json::Value,
    pub provider_indicated_time_unix_ms: Option<i64>,
}

/// Shape each transport must implement. `register_request` and
/// `foreground_execute` are optional in the spec; the default
/// implementations here are the "not provided" case.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Adds `input` to this transport's subscription set so
    /// `background_execute` picks it up. Fired fire-and-forget by
    /// `Adapter::handle_request` (spec.md §4.H step 3).
    async fn register_request(&self, _input: &serde_json::Value) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Synchronous in-request path. `Ok(None)` means "fall through to
    /// background polling"; `Err` is an unrecoverable request failure
    /// (spec.md §9 Open Question, resolved that way here).
    async fn foreground_execute(&self, _input: &serde_json::Value) -> Result<Option<serde_json::Value>, AdapterError> {
        Ok(None)
    }

    /// Invoked repeatedly by the `BackgroundExecutor` (spec.md §4.I),
    /// never concurrently with itself for the same transport instance.
    async fn background_execute(&self) -> Result<(), AdapterError>;

    /// Minimum period between successive `background_execute` invocations
    /// for this transport (`BACKGROUND_EXECUTE_MS_HTTP|WS|SSE`).
    fn min_period(&self) -> Duration;
}

/// User-supplied request preparation (spec.md §4.E.1): given all currently
/// subscribed params, produce one or more DP calls (batching is a matter of
/// grouping params into fewer `HttpRequest`s).
pub type PrepareRequestsFn =
    Arc<dyn Fn(&[serde_json::Value], &serde_json::Value) -> Vec<PreparedBatch> + Send + Sync>;

pub struct PreparedBatch {
    pub params_subset: Vec<serde_json::Value>,
    pub request: HttpRequest,
    /// Credit cost under the api-credit strategy; 1 under every other
    /// strategy.
    pub cost: u32,
}

/// User-supplied response parsing (spec.md §4.E.1): turn one provider
/// response into zero or more cacheable results.
pub type ParseResponseFn =
    Arc<dyn Fn(&[serde_json::Value], &ProviderResponse) -> Result<Vec<TransportResult>, String> + Send + Sync>;
