//! Local expiring-sorted-set, capped at `SUBSCRIPTION_SET_MAX_ITEMS`,
//! ordered by last-update (spec.md §4.B "Local"). Overflow evicts the
//! least-recently-used entry with a warning, mirroring the teacher's
//! `DashMap`-backed registries (`actors::ActorRegistry`,
//! `realtime::websocket::ConnectionTracker`).

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{SubscriptionEntry, SubscriptionSet};
use crate::cache::now_unix_ms;
use crate::error::AdapterError;

pub struct LocalSubscriptionSet {
    entries: DashMap<String, SubscriptionEntry>,
    /// Tail = most recently updated. Guarded separately from `entries`
    /// because an update needs to both look up and reorder.
    order: Mutex<VecDeque<String>>,
    max_items: u64,
}

impl LocalSubscriptionSet {
    pub fn new(max_items: u64) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_items,
        }
    }

    fn touch(&self, key: &str) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.to_string());
    }

    fn evict_if_over_capacity(&self) {
        while self.entries.len() as u64 > self.max_items {
            let lru = {
                let mut order = self.order.lock();
                order.pop_front()
            };
            match lru {
                Some(key) => {
                    self.entries.remove(&key);
                    tracing::warn!(key = %key, "subscription set at capacity, evicting least-recently-used entry");
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl SubscriptionSet for LocalSubscriptionSet {
    async fn add(&self, key: &str, value: serde_json::Value, ttl_ms: u64) -> Result<(), AdapterError> {
        let expire_at_unix_ms = now_unix_ms() + ttl_ms as i64;
        self.entries.insert(
            key.to_string(),
            SubscriptionEntry { key: key.to_string(), value, expire_at_unix_ms },
        );
        self.touch(key);
        self.evict_if_over_capacity();
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<SubscriptionEntry>, AdapterError> {
        let now = now_unix_ms();
        // Snapshot keys before iterating so a concurrent `add` from another
        // request never races with this read (spec.md §5 ordering guarantees).
        let snapshot: Vec<SubscriptionEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        Ok(snapshot.into_iter().filter(|e| !e.is_expired(now)).collect())
    }
}
