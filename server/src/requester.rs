//! Serialized HTTP client obeying the rate limiter and per-fingerprint
//! coalescing (spec.md §4.D). Grounded on the teacher's `DashMap`-keyed
//! registries (`actors::ActorRegistry::get_or_spawn`,
//! `realtime::websocket::ConnectionTracker`): a `DashMap` tracks in-flight
//! calls by coalesce key so concurrent callers share one outbound request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AdapterError;
use crate::rate_limit::RateLimiter;

/// A provider HTTP call to make, produced by a transport's
/// `prepare_requests`/connection-URL logic.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub duration_ms: u64,
}

struct InFlight {
    sender: broadcast::Sender<Result<ProviderResponse, String>>,
}

pub struct Requester {
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    in_flight: DashMap<String, InFlight>,
    timeout: Duration,
}

impl Requester {
    pub fn new(rate_limiter: Arc<RateLimiter>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, rate_limiter, in_flight: DashMap::new(), timeout })
    }

    /// `endpoint` identifies which rate-limit allocation to draw from;
    /// `coalesce_key` identifies requests that should share one outbound
    /// call (spec.md §3 "coalesceKey is derived from (endpoint, transport,
    /// input-batch)"). `cost` is the request's credit cost under the
    /// api-credit strategy (default 1 elsewhere).
    pub async fn request(
        &self,
        endpoint: &str,
        coalesce_key: &str,
        cost: u32,
        req: HttpRequest,
    ) -> Result<ProviderResponse, AdapterError> {
        // Fast path: attach to an in-flight call with the same fingerprint.
        if let Some(entry) = self.in_flight.get(coalesce_key) {
            let mut rx = entry.sender.subscribe();
            drop(entry);
            return self.await_shared(&mut rx).await;
        }

        // Become the leader for this coalesce key: everyone who arrives
        // while we're in flight attaches to our broadcast instead of
        // issuing their own HTTP call (Invariant 1).
        let (tx, mut rx) = broadcast::channel(1);
        let inserted_as_leader = match self.in_flight.entry(coalesce_key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(InFlight { sender: tx.clone() });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(o) => {
                rx = o.get().sender.subscribe();
                false
            }
        };

        if !inserted_as_leader {
            return self.await_shared(&mut rx).await;
        }

        let _permit = self.rate_limiter.acquire(endpoint, cost).await?;

        let start = Instant::now();
        let result = self.execute(req).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.in_flight.remove(coalesce_key);

        match result {
            Ok((status, body)) => {
                let response = ProviderResponse { status, body, duration_ms };
                let _ = tx.send(Ok(response.clone()));
                Ok(response)
            }
            Err(message) => {
                let _ = tx.send(Err(message.clone()));
                Err(AdapterError::Upstream(message))
            }
        }
    }

    async fn await_shared(
        &self,
        rx: &mut broadcast::Receiver<Result<ProviderResponse, String>>,
    ) -> Result<ProviderResponse, AdapterError> {
        match rx.recv().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(AdapterError::Upstream(message)),
            Err(_) => Err(AdapterError::Internal("in-flight request coalescing channel closed".into())),
        }
    }

    async fn execute(&self, req: HttpRequest) -> Result<(u16, serde_json::Value), String> {
        let mut builder = self.client.request(req.method, &req.url).timeout(self.timeout);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| format!("Provider request failed: {e}"))?;
        let status = response.status().as_u16();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::Value::Null);

        if status >= 400 {
            return Err(format!("Provider request failed with status {status}: {body}"));
        }
        Ok((status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitStrategy;
    use std::collections::HashMap;

    fn requester() -> Requester {
        let mut allocations = HashMap::new();
        allocations.insert("price".to_string(), 100.0);
        let rate_limiter = Arc::new(RateLimiter::new(&allocations, 6000.0, RateLimitStrategy::Burst, 100));
        Requester::new(rate_limiter, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn unreachable_host_surfaces_as_upstream_error() {
        let requester = requester();
        let req = HttpRequest {
            method: reqwest::Method::GET,
            url: "http://127.0.0.1:1/unreachable".to_string(),
            headers: vec![],
            body: None,
        };
        let result = requester.request("price", "coalesce-key", 1, req).await;
        assert!(matches!(result, Err(AdapterError::Upstream(_))));
    }
}
