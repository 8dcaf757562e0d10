//! Remote (redis-backed) cache + the distributed writer lock (spec.md
//! §4.A, §9 "Reader-writer cache lock"). Keyed by the persisted-state
//! layout from spec.md §6:
//! `{CACHE_PREFIX}-{ADAPTER_NAME}-{endpoint}-{transport}-{cache-key}`.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};

use super::{now_unix_ms, Cache, CacheEntry, Timestamps};
use crate::error::AdapterError;

#[derive(Clone)]
pub struct RemoteCache {
    conn: ConnectionManager,
}

impl RemoteCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub fn arc(self) -> std::sync::Arc<dyn Cache> {
        std::sync::Arc::new(self)
    }
}

#[async_trait]
impl Cache for RemoteCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AdapterError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| AdapterError::Internal(format!("redis GET failed: {e}")))?;

        let Some(raw) = raw else { return Ok(None) };
        let entry: CacheEntry = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::Internal(format!("corrupt cache entry for {key}: {e}")))?;

        // Redis' own TTL is the primary eviction mechanism, but a clock-skewed
        // reader should still treat a stale-looking entry as absent.
        if entry.is_expired(now_unix_ms()) {
            return Ok(None);
        }
        Ok(Some(entry))
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
        let serialized = serde_json::to_string(&entry)
            .map_err(|e| AdapterError::Internal(format!("failed to serialize cache entry: {e}")))?;

        let mut conn = self.conn.clone();
        let ttl_secs = (ttl_ms / 1000).max(1);
        conn.set_ex::<_, _, ()>(key, serialized, ttl_secs)
            .await
            .map_err(|e| AdapterError::Internal(format!("redis SET failed: {e}")))?;
        Ok(())
    }
}

/// Exclusive lease used to enforce a single writer per `(adapter, cache
/// prefix)` when multiple processes share a remote cache (spec.md §4.A,
/// Invariant-adjacent to §9's "Reader-writer cache lock" note).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn lock(&self, name: &str, ttl_ms: u64, retries: u32) -> Result<LockGuard, AdapterError>;
}

pub struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
    renew: tokio::task::JoinHandle<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renew.abort();
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        // Best-effort release; the lease would otherwise simply expire.
        tokio::spawn(async move {
            let _: Result<(), _> = conn.del::<_, ()>(&key).await;
        });
    }
}

#[async_trait]
impl DistributedLock for RemoteCache {
    async fn lock(&self, name: &str, ttl_ms: u64, retries: u32) -> Result<LockGuard, AdapterError> {
        // `name` is the caller-supplied full lock key, e.g.
        // `{CACHE_PREFIX}-{ADAPTER_NAME}` (spec.md §6 persisted state layout).
        let key = name.to_string();
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        for attempt in 0..retries.max(1) {
            let acquired: bool = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("PX")
                .arg(ttl_ms)
                .arg("NX")
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .map_err(|e| AdapterError::Internal(format!("redis lock attempt failed: {e}")))?
                .is_some();

            if acquired {
                let renew_conn = self.conn.clone();
                let renew_key = key.clone();
                let renew_token = token.clone();
                let renew_interval = Duration::from_millis(ttl_ms / 3).max(Duration::from_millis(50));
                let renew = tokio::spawn(async move {
                    let mut conn = renew_conn;
                    let mut ticker = tokio::time::interval(renew_interval);
                    loop {
                        ticker.tick().await;
                        // Refresh the lease only if we still hold it.
                        let script = redis::Script::new(
                            r#"if redis.call("get", KEYS[1]) == ARGV[1] then
                                 return redis.call("pexpire", KEYS[1], ARGV[2])
                               else
                                 return 0
                               end"#,
                        );
                        let _: Result<i64, _> = script
                            .key(&renew_key)
                            .arg(&renew_token)
                            .arg(ttl_ms)
                            .invoke_async(&mut conn)
                            .await;
                    }
                });

                return Ok(LockGuard { conn: self.conn.clone(), key, token, renew });
            }

            if attempt + 1 < retries {
                tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            }
        }

        Err(AdapterError::Internal(format!(
            "failed to acquire writer lock {name:?} after {retries} attempts"
        )))
    }
}
