//! Remote subscription set: a redis sorted set scored by expiration unix-ms
//! (spec.md §4.B "Remote"). `get_all` first prunes anything whose score is
//! already in the past, then returns the rest — the prune-then-read two-step
//! the spec calls for.

use redis::{aio::ConnectionManager, AsyncCommands};

use super::{SubscriptionEntry, SubscriptionSet};
use crate::cache::now_unix_ms;
use crate::error::AdapterError;
use async_trait::async_trait;

pub struct RemoteSubscriptionSet {
    conn: ConnectionManager,
    /// Sorted-set key; values hold `key` + a JSON-encoded `value` column in
    /// a parallel hash so the sorted set itself only carries members.
    zkey: String,
    hkey: String,
}

impl RemoteSubscriptionSet {
    pub async fn connect(redis_url: &str, zkey: String) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let hkey = format!("{zkey}-values");
        Ok(Self { conn, zkey, hkey })
    }
}

#[async_trait]
impl SubscriptionSet for RemoteSubscriptionSet {
    async fn add(&self, key: &str, value: serde_json::Value, ttl_ms: u64) -> Result<(), AdapterError> {
        let expire_at = now_unix_ms() + ttl_ms as i64;
        let serialized = serde_json::to_string(&value)
            .map_err(|e| AdapterError::Internal(format!("failed to serialize subscription value: {e}")))?;

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(&self.zkey, key, expire_at)
            .await
            .map_err(|e| AdapterError::Internal(format!("redis ZADD failed: {e}")))?;
        conn.hset::<_, _, _, ()>(&self.hkey, key, serialized)
            .await
            .map_err(|e| AdapterError::Internal(format!("redis HSET failed: {e}")))?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<SubscriptionEntry>, AdapterError> {
        let mut conn = self.conn.clone();
        let now = now_unix_ms();

        // Prune expired members first (score <= now), then read the rest.
        let expired: Vec<String> = conn
            .zrangebyscore(&self.zkey, f64::MIN, now as f64)
            .await
            .map_err(|e| AdapterError::Internal(format!("redis ZRANGEBYSCORE failed: {e}")))?;
        if !expired.is_empty() {
            conn.zrem::<_, _, ()>(&self.zkey, &expired)
                .await
                .map_err(|e| AdapterError::Internal(format!("redis ZREM failed: {e}")))?;
            conn.hdel::<_, _, ()>(&self.hkey, &expired)
                .await
                .map_err(|e| AdapterError::Internal(format!("redis HDEL failed: {e}")))?;
        }

        let members: Vec<(String, i64)> = conn
            .zrange_withscores(&self.zkey, 0, -1)
            .await
            .map_err(|e| AdapterError::Internal(format!("redis ZRANGE failed: {e}")))?;

        let mut out = Vec::with_capacity(members.len());
        for (key, expire_at_unix_ms) in members {
            let raw: Option<String> = conn
                .hget(&self.hkey, &key)
                .await
                .map_err(|e| AdapterError::Internal(format!("redis HGET failed: {e}")))?;
            let Some(raw) = raw else { continue };
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| AdapterError::Internal(format!("corrupt subscription value for {key}: {e}")))?;
            out.push(SubscriptionEntry { key, value, expire_at_unix_ms });
        }
        Ok(out)
    }
}
