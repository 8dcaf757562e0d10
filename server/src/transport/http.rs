//! HTTP batching (pull) transport (spec.md §4.E.1).

use async_trait::async_trait;

use super::{ParseResponseFn, PrepareRequestsFn, Transport, TransportDeps};
use crate::cache::{now_unix_ms, Timestamps};
use crate::error::AdapterError;

pub struct HttpBatchTransport {
    deps: TransportDeps,
    prepare_requests: PrepareRequestsFn,
    parse_response: ParseResponseFn,
    warmup_subscription_ttl_ms: u64,
    cache_max_age_ms: u64,
    min_period_ms: u64,
}

impl HttpBatchTransport {
    pub fn new(
        deps: TransportDeps,
        prepare_requests: PrepareRequestsFn,
        parse_response: ParseResponseFn,
        warmup_subscription_ttl_ms: u64,
        cache_max_age_ms: u64,
        min_period_ms: u64,
    ) -> Self {
        Self { deps, prepare_requests, parse_response, warmup_subscription_ttl_ms, cache_max_age_ms, min_period_ms }
    }
}

#[async_trait]
impl Transport for HttpBatchTransport {
    fn name(&self) -> &str {
        &self.deps.transport_name
    }

    async fn register_request(&self, input: &serde_json::Value) -> Result<(), AdapterError> {
        let key = self.deps.cache_key_for(input);
        self.deps.subscriptions.add(&key, input.clone(), self.warmup_subscription_ttl_ms).await
    }

    async fn background_execute(&self) -> Result<(), AdapterError> {
        let subscribed = self.deps.subscriptions.get_all().await?;
        if subscribed.is_empty() {
            return Ok(());
        }
        let params: Vec<serde_json::Value> = subscribed.iter().map(|e| e.value.clone()).collect();

        let batches = (self.prepare_requests)(&params, &serde_json::Value::Null);

        for batch in batches {
            let coalesce_key = format!(
                "{}-{}-{}",
                self.deps.endpoint_name,
                self.deps.transport_name,
                serde_json::to_string(&batch.params_subset).unwrap_or_default()
            );
            let requested_at = now_unix_ms();

            match self.deps.requester.request(&self.deps.endpoint_name, &coalesce_key, batch.cost, batch.request).await {
                Ok(response) => {
                    let received_at = now_unix_ms();
                    match (self.parse_response)(&batch.params_subset, &response) {
                        Ok(results) => {
                            for result in results {
                                let key = self.deps.cache_key_for(&result.params);
                                let timestamps = Timestamps {
                                    provider_data_requested: Some(requested_at),
                                    provider_data_received: Some(received_at),
                                    provider_data_stream_established: None,
                                    provider_indicated_time: result.provider_indicated_time_unix_ms,
                                };
                                self.deps
                                    .cache
                                    .set(&key, result.value, self.cache_max_age_ms, timestamps)
                                    .await?;
                            }
                        }
                        Err(message) => {
                            tracing::warn!(error = %message, "failed to parse provider response");
                            self.write_error_envelope(&batch.params_subset, &message, requested_at).await?;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "provider request failed");
                    self.write_error_envelope(&batch.params_subset, &err.to_string(), requested_at).await?;
                }
            }
        }
        Ok(())
    }

    fn min_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.min_period_ms)
    }
}

impl HttpBatchTransport {
    /// Writes a deterministic 502 envelope for every param in the failed
    /// batch so subsequent requests fail fast instead of timing out
    /// (spec.md §4.E.1, Invariant around S6).
    async fn write_error_envelope(&self, params_subset: &[serde_json::Value], message: &str, requested_at: i64) -> Result<(), AdapterError> {
        for params in params_subset {
            let key = self.deps.cache_key_for(params);
            let envelope = serde_json::json!({
                "status": "errored",
                "statusCode": 502,
                "error": { "name": "Upstream", "message": message },
            });
            let timestamps = Timestamps {
                provider_data_requested: Some(requested_at),
                provider_data_received: Some(now_unix_ms()),
                provider_data_stream_established: None,
                provider_indicated_time: None,
            };
            self.deps.cache.set(&key, envelope, self.cache_max_age_ms, timestamps).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::cache::{Cache, LocalCache, ResponseCache};
    use crate::config::RateLimitStrategy;
    use crate::rate_limit::RateLimiter;
    use crate::requester::{HttpRequest, Requester};
    use crate::subscription::LocalSubscriptionSet;

    fn deps() -> TransportDeps {
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::new(1_000));
        let mut allocations = HashMap::new();
        allocations.insert("price".to_string(), 100.0);
        let rate_limiter = Arc::new(RateLimiter::new(&allocations, 6_000.0, RateLimitStrategy::Burst, 100));
        let requester = Arc::new(Requester::new(rate_limiter, std::time::Duration::from_secs(5)).unwrap());
        TransportDeps {
            cache: ResponseCache::new(cache, "ea", "TEST", "price", "default"),
            subscriptions: Arc::new(LocalSubscriptionSet::new(1_000)),
            requester,
            adapter_name: "TEST".to_string(),
            endpoint_name: "price".to_string(),
            transport_name: "default".to_string(),
            max_common_key_size: 300,
        }
    }

    #[tokio::test]
    async fn s6_provider_failure_caches_error_envelope() {
        let deps = deps();
        let params = serde_json::json!({"from": "ETH", "to": "USD"});
        let key = deps.cache_key_for(&params);

        let transport = HttpBatchTransport::new(
            deps,
            std::sync::Arc::new(|params: &[serde_json::Value], _settings: &serde_json::Value| {
                vec![crate::transport::PreparedBatch {
                    params_subset: params.to_vec(),
                    cost: 1,
                    request: HttpRequest {
                        method: reqwest::Method::GET,
                        // unroutable: forces a connection failure without touching the network.
                        url: "http://127.0.0.1:1/unreachable".to_string(),
                        headers: vec![],
                        body: None,
                    },
                }]
            }),
            std::sync::Arc::new(|_params: &[serde_json::Value], _response: &crate::requester::ProviderResponse| Ok(vec![])),
            30_000,
            30_000,
            1_000,
        );

        transport.register_request(&params).await.unwrap();
        transport.background_execute().await.unwrap();

        let entry = transport.deps.cache.get(&key).await.unwrap().expect("error envelope should be cached");
        assert_eq!(entry.value["status"], "errored");
        assert_eq!(entry.value["statusCode"], 502);
        assert!(entry.value["error"]["message"].as_str().unwrap().contains("Provider request failed"));
    }
}
