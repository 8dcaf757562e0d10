//! Adapter (spec.md §4.H): composition root and `handle_request`, the
//! request lifecycle algorithm.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{derive_cache_key, Cache, FingerprintInput, PollOptions, ResponseCache};
use crate::config::Settings;
use crate::endpoint::Endpoint;
use crate::error::AdapterError;
use crate::rate_limit::RateLimiter;
use crate::requester::Requester;

/// `{"result":<any>, "data":{...}, "statusCode":200, "timestamps":{...}}`
/// (spec.md §6 success response shape).
pub struct HandledResponse {
    pub body: serde_json::Value,
    pub status_code: u16,
}

pub struct Adapter {
    pub name: String,
    pub default_endpoint: Option<String>,
    endpoints_map: HashMap<String, Arc<Endpoint>>,
    pub cache: Arc<dyn Cache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub requester: Arc<Requester>,
    pub settings: Arc<Settings>,
}

impl Adapter {
    /// Builds `endpointsMap` from each endpoint's name + aliases; collisions
    /// are fatal (spec.md §3 "Adapter").
    pub fn new(
        name: String,
        default_endpoint: Option<String>,
        endpoints: Vec<Endpoint>,
        cache: Arc<dyn Cache>,
        rate_limiter: Arc<RateLimiter>,
        requester: Arc<Requester>,
        settings: Arc<Settings>,
    ) -> anyhow::Result<Self> {
        let mut endpoints_map = HashMap::new();
        for endpoint in endpoints {
            let endpoint = Arc::new(endpoint);
            for routing_name in endpoint.routing_names() {
                if endpoints_map.insert(routing_name.clone(), endpoint.clone()).is_some() {
                    anyhow::bail!("duplicate endpoint name or alias {routing_name:?}");
                }
            }
        }
        Ok(Self {
            name: name.to_uppercase(),
            default_endpoint,
            endpoints_map,
            cache,
            rate_limiter,
            requester,
            settings,
        })
    }

    pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints_map.get(&name.to_lowercase())
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        let mut seen = std::collections::HashSet::new();
        self.endpoints_map.values().filter(move |e| seen.insert(Arc::as_ptr(e)))
    }

    /// The request lifecycle (spec.md §4.H). Preconditions: the HTTP layer
    /// has parsed `body.data`, resolved the endpoint name (falling back to
    /// `default_endpoint`), and handed us the raw `data` object.
    pub async fn handle_request(&self, endpoint_name: &str, mut data: serde_json::Value) -> Result<HandledResponse, AdapterError> {
        let endpoint = self
            .endpoint(endpoint_name)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("endpoint {endpoint_name:?} is not registered on this adapter")))?;

        data = endpoint.prepare_request(&self.name, data)?;
        let transport = endpoint.router.resolve(&data)?;

        let response_cache = ResponseCache::new(self.cache.clone(), &self.settings.cache_prefix, &self.name, &endpoint.name, transport.name());

        let fingerprint = FingerprintInput {
            adapter_name: &self.name,
            endpoint_name: &endpoint.name,
            transport_name: transport.name(),
            data: &data,
            selected_settings: &serde_json::Value::Null,
        };
        let cache_key = derive_cache_key(&fingerprint, self.settings.max_common_key_size);

        // Step 2: cache-first.
        let cached = response_cache.get(&cache_key).await?;
        if cached.is_some() {
            crate::metrics::record_cache_hit(&endpoint.name);
        } else {
            crate::metrics::record_cache_miss(&endpoint.name);
        }

        // Step 3: fire registration in the background; join it only when we
        // must (step 6), so a cache hit never waits on it.
        let registration_task = {
            let transport = transport.clone();
            let data = data.clone();
            tokio::spawn(async move { transport.register_request(&data).await })
        };

        // Step 4: cache hit short-circuits immediately.
        if let Some(entry) = cached {
            return Ok(envelope_from_cache_entry(entry));
        }

        // Step 5: optional synchronous path.
        match transport.foreground_execute(&data).await {
            Ok(Some(value)) => return Ok(HandledResponse { body: success_envelope(value, None), status_code: 200 }),
            Ok(None) => {}
            Err(err) => return Err(err),
        }

        // Step 6: join registration now that we're actually waiting on it.
        match registration_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_err) => return Err(AdapterError::Internal(format!("registration task panicked: {join_err}"))),
        }

        // Step 7: block on the cache filling in.
        let opts = PollOptions {
            max_retries: self.settings.cache_polling_max_retries,
            sleep_ms: self.settings.cache_polling_sleep_ms,
        };
        match response_cache.poll_for_key(&cache_key, opts).await? {
            Some(entry) => Ok(envelope_from_cache_entry(entry)),
            None => Err(AdapterError::Timeout(format!(
                "cache polling exhausted after {} retries for endpoint {endpoint_name:?}",
                opts.max_retries
            ))),
        }
    }
}

fn success_envelope(result: serde_json::Value, timestamps: Option<&crate::cache::Timestamps>) -> serde_json::Value {
    serde_json::json!({
        "result": result,
        "data": { "result": result },
        "statusCode": 200,
        "timestamps": timestamps_json(timestamps),
    })
}

fn timestamps_json(timestamps: Option<&crate::cache::Timestamps>) -> serde_json::Value {
    match timestamps {
        None => serde_json::json!({
            "providerDataRequestedUnixMs": null,
            "providerDataReceivedUnixMs": null,
            "providerIndicatedTimeUnixMs": null,
        }),
        Some(t) => serde_json::json!({
            "providerDataRequestedUnixMs": t.provider_data_requested,
            "providerDataReceivedUnixMs": t.provider_data_received,
            "providerIndicatedTimeUnixMs": t.provider_indicated_time,
        }),
    }
}

fn envelope_from_cache_entry(entry: crate::cache::CacheEntry) -> HandledResponse {
    // A cached entry may itself be a pre-built error envelope (written by a
    // transport's background_execute after a failed DP call, spec.md
    // §4.E.1); pass it through as-is rather than re-wrapping it.
    if entry.value.get("status").and_then(|v| v.as_str()) == Some("errored") {
        let status_code = entry.value.get("statusCode").and_then(|v| v.as_u64()).unwrap_or(502) as u16;
        return HandledResponse { body: entry.value, status_code };
    }
    let result = entry.value.get("result").cloned().unwrap_or(entry.value.clone());
    HandledResponse { body: success_envelope(result, Some(&entry.timestamps)), status_code: 200 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::config::RateLimitStrategy;
    use crate::router::TransportRouter;
    use crate::transport::Transport;
    use async_trait::async_trait;

    struct AlwaysMissTransport;

    #[async_trait]
    impl Transport for AlwaysMissTransport {
        fn name(&self) -> &str {
            "default"
        }
        async fn background_execute(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn min_period(&self) -> std::time::Duration {
            std::time::Duration::from_millis(10)
        }
    }

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings {
            ea_mode: crate::config::EaMode::ReaderWriter,
            ea_host: "0.0.0.0".into(),
            ea_port: 8080,
            base_url: "/".into(),
            metrics_port: None,
            cache_type: crate::config::CacheType::Local,
            cache_max_age_ms: 30_000,
            cache_max_items: 10_000,
            cache_prefix: "ea".into(),
            cache_polling_max_retries: 2,
            cache_polling_sleep_ms: 5,
            cache_lock_duration_ms: 30_000,
            cache_lock_retries: 5,
            max_common_key_size: 300,
            max_payload_size_limit: 1_000_000,
            rate_limit_capacity_second: None,
            rate_limit_capacity_minute: None,
            rate_limit_capacity: None,
            rate_limiting_strategy: RateLimitStrategy::Burst,
            max_http_request_queue_length: 1_000,
            background_execute_ms_http: 1_000,
            background_execute_ms_ws: 1_000,
            background_execute_ms_sse: 1_000,
            background_execute_timeout_ms: 180_000,
            warmup_subscription_ttl_ms: 30_000,
            ws_subscription_ttl_ms: 120_000,
            ws_subscription_unresponsive_ttl_ms: 120_000,
            ws_heartbeat_interval_ms: 30_000,
            sse_subscription_ttl_ms: 120_000,
            sse_keepalive_sleep_ms: 60_000,
            api_timeout_ms: 30_000,
            correlation_id_enabled: true,
            log_level: "debug".into(),
            metrics_enabled: false,
            experimental_metrics_enabled: false,
            redis_url: "redis://127.0.0.1:6379".into(),
            adapter_name: "TEST".into(),
            tls_enabled: false,
            mtls_enabled: false,
            tls_private_key: None,
            tls_public_key: None,
            tls_ca: None,
            tls_passphrase: None,
        })
    }

    fn adapter_with_always_miss_endpoint() -> Adapter {
        let settings = test_settings();
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::new(settings.cache_max_items));
        let mut allocations = HashMap::new();
        allocations.insert("price".to_string(), 100.0);
        let rate_limiter = Arc::new(RateLimiter::new(&allocations, 6_000.0, RateLimitStrategy::Burst, 100));
        let requester = Arc::new(Requester::new(rate_limiter.clone(), std::time::Duration::from_secs(5)).unwrap());

        let router = TransportRouter::new(
            vec![(crate::router::DEFAULT_TRANSPORT_NAME.to_string(), Arc::new(AlwaysMissTransport) as Arc<dyn Transport>)],
            None,
            None,
        )
        .unwrap();
        let endpoint = Endpoint {
            name: "price".to_string(),
            aliases: vec![],
            router,
            overrides: HashMap::new(),
            request_transforms: vec![],
            custom_input_validation: None,
        };
        Adapter::new("TEST".to_string(), Some("price".to_string()), vec![endpoint], cache, rate_limiter, requester, settings).unwrap()
    }

    #[tokio::test]
    async fn s1_cache_miss_times_out_with_504() {
        let adapter = adapter_with_always_miss_endpoint();
        let data = serde_json::json!({"from": "ETH", "to": "USD"});
        let result = adapter.handle_request("price", data).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_not_found() {
        let adapter = adapter_with_always_miss_endpoint();
        let result = adapter.handle_request("nonexistent", serde_json::json!({})).await;
        assert!(matches!(result, Err(AdapterError::NotFound(_))));
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_without_waiting_on_registration() {
        let adapter = adapter_with_always_miss_endpoint();
        let response_cache = ResponseCache::new(adapter.cache.clone(), &adapter.settings.cache_prefix, &adapter.name, "price", "default");
        let data = serde_json::json!({"from": "ETH", "to": "USD"});
        let fingerprint = FingerprintInput {
            adapter_name: &adapter.name,
            endpoint_name: "price",
            transport_name: "default",
            data: &data,
            selected_settings: &serde_json::Value::Null,
        };
        let key = derive_cache_key(&fingerprint, adapter.settings.max_common_key_size);
        response_cache
            .set(&key, serde_json::json!(1234), 30_000, crate::cache::Timestamps::default())
            .await
            .unwrap();

        let result = adapter.handle_request("price", data).await.unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body["result"], 1234);
    }
}
