//! TTL key→value cache (spec.md §4.A) plus the cache-key fingerprint
//! derivation (§3) shared by every endpoint.

mod local;
mod remote;

pub use local::LocalCache;
pub use remote::{DistributedLock, LockGuard, RemoteCache};

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::AdapterError;

/// Recorded provider-call timings, carried on every cache entry so clients
/// can observe staleness (spec.md §3, §6 success response shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(rename = "providerDataRequested")]
    pub provider_data_requested: Option<i64>,
    #[serde(rename = "providerDataReceived")]
    pub provider_data_received: Option<i64>,
    #[serde(rename = "providerDataStreamEstablished")]
    pub provider_data_stream_established: Option<i64>,
    #[serde(rename = "providerIndicatedTime")]
    pub provider_indicated_time: Option<i64>,
}

/// A single cached adapter response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(rename = "expireAtUnixMs")]
    pub expire_at_unix_ms: i64,
    pub timestamps: Timestamps,
    /// When this entry was written; used only for staleness metrics, never
    /// for eviction (eviction is driven purely by `expire_at_unix_ms`).
    #[serde(rename = "setAt", default)]
    pub set_at_unix_ms: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expire_at_unix_ms
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Options for `Cache::poll_for_key`.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub max_retries: u32,
    pub sleep_ms: u64,
}

/// The cache contract. Implemented by both the local (moka) and remote
/// (redis) backends; everything above this trait (endpoints, transports,
/// the adapter) is agnostic to which backend is active.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AdapterError>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl_ms: u64, timestamps: Timestamps) -> Result<(), AdapterError>;

    /// Repeatedly `get` with a fixed delay between attempts; returns the
    /// first hit or `None` once `max_retries` is exhausted. This is the
    /// suspension point a blocked client request waits on (spec.md §4.A, §4.H step 7).
    async fn poll_for_key(&self, key: &str, opts: PollOptions) -> Result<Option<CacheEntry>, AdapterError> {
        for attempt in 0..opts.max_retries {
            if let Some(entry) = self.get(key).await? {
                return Ok(Some(entry));
            }
            if attempt + 1 < opts.max_retries {
                tokio::time::sleep(std::time::Duration::from_millis(opts.sleep_ms)).await;
            }
        }
        Ok(None)
    }
}

/// A cache handle scoped to one `(adapter, endpoint, transport)` triple, as
/// handed to each transport (spec.md §3 "Ownership"). Transports never see
/// the raw cache or the other endpoints' keys.
#[derive(Clone)]
pub struct ResponseCache {
    inner: std::sync::Arc<dyn Cache>,
    prefix: String,
}

impl ResponseCache {
    pub fn new(inner: std::sync::Arc<dyn Cache>, cache_prefix: &str, adapter: &str, endpoint: &str, transport: &str) -> Self {
        Self {
            inner,
            prefix: format!("{cache_prefix}-{adapter}-{endpoint}-{transport}"),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}-{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AdapterError> {
        self.inner.get(&self.namespaced(key)).await
    }

    pub async fn set(&self, key: &str, value: serde_json::Value, ttl_ms: u64, timestamps: Timestamps) -> Result<(), AdapterError> {
        self.inner.set(&self.namespaced(key), value, ttl_ms, timestamps).await
    }

    pub async fn poll_for_key(&self, key: &str, opts: PollOptions) -> Result<Option<CacheEntry>, AdapterError> {
        self.inner.poll_for_key(&self.namespaced(key), opts).await
    }
}

/// Inputs to the cache-key fingerprint (spec.md §3).
pub struct FingerprintInput<'a> {
    pub adapter_name: &'a str,
    pub endpoint_name: &'a str,
    pub transport_name: &'a str,
    pub data: &'a serde_json::Value,
    /// Selected adapter settings folded into the fingerprint (e.g. cache TTL
    /// configuration that would otherwise make two equivalently-shaped
    /// requests collide across differently-configured deployments).
    pub selected_settings: &'a serde_json::Value,
}

/// Deterministic fingerprint derivation: lowercase values, sort keys,
/// JSON-encode, then fall back to a SHA-1/base64 digest once the encoded
/// form exceeds `max_common_key_size` (spec.md §3).
pub fn derive_cache_key(input: &FingerprintInput<'_>, max_common_key_size: usize) -> String {
    let normalized = normalize_json(input.data);
    let normalized_settings = normalize_json(input.selected_settings);

    let composite = serde_json::json!({
        "adapter": input.adapter_name.to_lowercase(),
        "endpoint": input.endpoint_name.to_lowercase(),
        "transport": input.transport_name.to_lowercase(),
        "data": normalized,
        "settings": normalized_settings,
    });

    let encoded = serde_json::to_string(&composite).unwrap_or_default();

    if encoded.len() > max_common_key_size {
        let mut hasher = Sha1::new();
        hasher.update(encoded.as_bytes());
        let digest = hasher.finalize();
        base64::engine::general_purpose::STANDARD.encode(digest)
    } else {
        encoded
    }
}

/// Lowercase every string value and sort every object's keys, recursively,
/// so semantically-identical requests always normalize to the same bytes.
fn normalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(s.to_lowercase()),
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(normalize_json).collect()),
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.to_lowercase(), normalize_json(v));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}
