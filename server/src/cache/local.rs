//! Local (in-process) cache backend: a bounded, capacity-evicting,
//! per-entry-TTL map built on `moka`. Matches spec.md §4.A "Local": bounded
//! LRU by count (`CACHE_MAX_ITEMS`), absolute per-entry expiration, constant
//! time lookups, expired entries treated as absent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::{future::Cache as MokaCache, Expiry};

use super::{now_unix_ms, Cache, CacheEntry, Timestamps};
use crate::error::AdapterError;

/// Reads the per-entry absolute expiration stamped on each `CacheEntry` so
/// moka can honor a different TTL per `set()` call instead of one TTL for
/// the whole cache.
struct PerEntryExpiry;

impl Expiry<String, CacheEntry> for PerEntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, created_at: Instant) -> Option<Duration> {
        let remaining_ms = (value.expire_at_unix_ms - now_unix_ms()).max(0) as u64;
        let _ = created_at;
        Some(Duration::from_millis(remaining_ms))
    }
}

pub struct LocalCache {
    inner: MokaCache<String, CacheEntry>,
}

impl LocalCache {
    pub fn new(max_items: u64) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_items)
            .expire_after(PerEntryExpiry)
            .build();
        Self { inner }
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AdapterError> {
        match self.inner.get(key).await {
            Some(entry) if !entry.is_expired(now_unix_ms()) => Ok(Some(entry)),
            Some(_) => {
                self.inner.invalidate(key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl_ms: u64, timestamps: Timestamps) -> Result<(), AdapterError> {
        let now = now_unix_ms();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            expire_at_unix_ms: now + ttl_ms as i64,
            timestamps,
            set_at_unix_ms: now,
        };
        self.inner.insert(key.to_string(), entry).await;
        Ok(())
    }
}

impl LocalCache {
    pub fn arc(max_items: u64) -> Arc<dyn Cache> {
        Arc::new(Self::new(max_items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache = LocalCache::new(100);
        cache
            .set("k", serde_json::json!({"result": 1}), 60_000, Timestamps::default())
            .await
            .unwrap();
        let got = cache.get("k").await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().value, serde_json::json!({"result": 1}));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cache = LocalCache::new(100);
        cache
            .set("k", serde_json::json!({"result": 1}), 1, Timestamps::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = cache.get("k").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let cache = LocalCache::new(100);
        assert!(cache.get("missing").await.unwrap().is_none());
    }
}
