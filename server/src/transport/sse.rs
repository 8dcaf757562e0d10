//! Server-Sent Events (push) transport (spec.md §4.E.3).
//!
//! Structurally a simpler cousin of the websocket transport: one
//! long-lived outbound HTTP GET whose response body is an unbounded byte
//! stream of `text/event-stream` frames, decoded line by line into `data:`
//! payloads. There is no outbound subscribe/unsubscribe protocol on the
//! wire in the general case, so `prepare_requests` determines the
//! connection URL (e.g. a `symbols=` query string) and the connection
//! itself is re-established whenever the desired symbol set changes shape
//! — unlike the websocket transport, which patches a stable connection via
//! messages.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::{Transport, TransportDeps, TransportResult};
use crate::cache::{now_unix_ms, Timestamps};
use crate::error::AdapterError;
use crate::requester::HttpRequest;

pub type UrlFn = Arc<dyn Fn(&[serde_json::Value]) -> String + Send + Sync>;
pub type EventParserFn = Arc<dyn Fn(&str) -> Vec<TransportResult> + Send + Sync>;
/// Produces the side-channel HTTP call issued every `SSE_KEEPALIVE_SLEEP`
/// (spec.md §4.E.3 "optional keep-alive HTTP call"); `None` disables it.
pub type KeepaliveRequestFn = Arc<dyn Fn() -> HttpRequest + Send + Sync>;

struct StreamHandle {
    subscribed: HashSet<String>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

pub struct SseTransport {
    deps: Arc<TransportDeps>,
    url: UrlFn,
    parse_event: EventParserFn,
    client: reqwest::Client,

    handle: Mutex<Option<StreamHandle>>,
    last_event_at_ms: Arc<AtomicI64>,

    subscription_ttl_ms: u64,
    unresponsive_ttl_ms: u64,
    cache_max_age_ms: u64,
    min_period_ms: u64,
    keepalive_sleep_ms: u64,
}

impl SseTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: TransportDeps,
        url: UrlFn,
        parse_event: EventParserFn,
        subscription_ttl_ms: u64,
        unresponsive_ttl_ms: u64,
        cache_max_age_ms: u64,
        min_period_ms: u64,
        keepalive: Option<(KeepaliveRequestFn, u64)>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let deps = Arc::new(deps);

        let keepalive_sleep_ms = if let Some((keepalive_request, keepalive_sleep_ms)) = keepalive {
            spawn_keepalive(deps.clone(), keepalive_request, keepalive_sleep_ms);
            keepalive_sleep_ms
        } else {
            0
        };

        Ok(Self {
            deps,
            url,
            parse_event,
            client,
            handle: Mutex::new(None),
            last_event_at_ms: Arc::new(AtomicI64::new(now_unix_ms())),
            subscription_ttl_ms,
            unresponsive_ttl_ms,
            cache_max_age_ms,
            min_period_ms,
            keepalive_sleep_ms,
        })
    }

    fn is_unresponsive(&self) -> bool {
        let last = self.last_event_at_ms.load(Ordering::SeqCst);
        now_unix_ms() - last > self.unresponsive_ttl_ms as i64
    }

    async fn connect(&self, desired: &[serde_json::Value], desired_keys: &HashSet<String>) -> Result<(), AdapterError> {
        let url = (self.url)(desired);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AdapterError::Upstream(format!("Provider request failed: sse connect error: {e}")))?;

        if !response.status().is_success() {
            return Err(AdapterError::Upstream(format!(
                "Provider request failed with status {}: sse stream rejected",
                response.status()
            )));
        }

        let mut byte_stream = response.bytes_stream();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let deps = self.deps.clone();
        let parse_event = self.parse_event.clone();
        let cache_max_age_ms = self.cache_max_age_ms;
        let last_event_at_ms = self.last_event_at_ms.clone();

        tokio::spawn(async move {
            let mut buffer = String::new();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    chunk = byte_stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                buffer.push_str(&String::from_utf8_lossy(&bytes));
                                while let Some(pos) = buffer.find('\n') {
                                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                                    buffer.drain(..=pos);
                                    let Some(payload) = line.strip_prefix("data:") else { continue };
                                    last_event_at_ms.store(now_unix_ms(), Ordering::SeqCst);
                                    for result in (parse_event)(payload.trim()) {
                                        let key = deps.cache_key_for(&result.params);
                                        let timestamps = Timestamps {
                                            provider_data_requested: None,
                                            provider_data_received: Some(now_unix_ms()),
                                            provider_data_stream_established: Some(now_unix_ms()),
                                            provider_indicated_time: result.provider_indicated_time_unix_ms,
                                        };
                                        if let Err(e) = deps.cache.set(&key, result.value, cache_max_age_ms, timestamps).await {
                                            tracing::warn!(error = %e, "failed to cache sse push result");
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "sse stream read error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        *self.handle.lock().await = Some(StreamHandle { subscribed: desired_keys.clone(), shutdown: shutdown_tx });
        self.last_event_at_ms.store(now_unix_ms(), Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.shutdown.send(true);
        }
    }
}

/// Fires `keepalive_request()` through the shared [`Requester`](crate::requester::Requester)
/// every `keepalive_sleep_ms`, for the lifetime of the transport. A fixed
/// coalesce key is fine here — keepalive calls from the same transport
/// instance are never meant to run concurrently with each other.
fn spawn_keepalive(deps: Arc<TransportDeps>, keepalive_request: KeepaliveRequestFn, keepalive_sleep_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(keepalive_sleep_ms.max(1)));
        ticker.tick().await; // first tick fires immediately; skip it, we just connected.
        loop {
            ticker.tick().await;
            let coalesce_key = format!("{}-{}-sse-keepalive", deps.endpoint_name, deps.transport_name);
            let request = keepalive_request();
            if let Err(err) = deps.requester.request(&deps.endpoint_name, &coalesce_key, 1, request).await {
                tracing::warn!(error = %err, "sse keepalive call failed");
            }
        }
    });
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &str {
        &self.deps.transport_name
    }

    async fn register_request(&self, input: &serde_json::Value) -> Result<(), AdapterError> {
        let key = self.deps.cache_key_for(input);
        self.deps.subscriptions.add(&key, input.clone(), self.subscription_ttl_ms).await
    }

    async fn background_execute(&self) -> Result<(), AdapterError> {
        let subscribed = self.deps.subscriptions.get_all().await?;
        let desired_params: Vec<serde_json::Value> = subscribed.iter().map(|e| e.value.clone()).collect();
        let desired_keys: HashSet<String> = subscribed.iter().map(|e| e.key.clone()).collect();

        let currently_subscribed = {
            let guard = self.handle.lock().await;
            guard.as_ref().map(|h| h.subscribed.clone())
        };

        let needs_reconnect = match &currently_subscribed {
            None => !desired_keys.is_empty(),
            Some(subscribed_keys) => subscribed_keys != &desired_keys || self.is_unresponsive(),
        };

        if needs_reconnect {
            self.disconnect().await;
            if desired_keys.is_empty() {
                return Ok(());
            }
            self.connect(&desired_params, &desired_keys).await?;
        }

        Ok(())
    }

    fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::{Cache, LocalCache, ResponseCache};
    use crate::config::RateLimitStrategy;
    use crate::rate_limit::RateLimiter;
    use crate::requester::Requester;
    use crate::subscription::LocalSubscriptionSet;

    fn deps() -> TransportDeps {
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::new(1_000));
        let mut allocations = HashMap::new();
        allocations.insert("price".to_string(), 100.0);
        let rate_limiter = Arc::new(RateLimiter::new(&allocations, 6_000.0, RateLimitStrategy::Burst, 100));
        let requester = Arc::new(Requester::new(rate_limiter, std::time::Duration::from_secs(5)).unwrap());
        TransportDeps {
            cache: ResponseCache::new(cache, "ea", "TEST", "price", "sse"),
            subscriptions: Arc::new(LocalSubscriptionSet::new(1_000)),
            requester,
            adapter_name: "TEST".to_string(),
            endpoint_name: "price".to_string(),
            transport_name: "sse".to_string(),
            max_common_key_size: 300,
        }
    }

    #[tokio::test]
    async fn background_execute_is_a_noop_with_no_subscriptions() {
        let transport = SseTransport::new(
            deps(),
            Arc::new(|_: &[serde_json::Value]| "http://127.0.0.1:1/unreachable".to_string()),
            Arc::new(|_: &str| vec![]),
            120_000,
            120_000,
            60_000,
            1_000,
            None,
        )
        .unwrap();
        assert!(transport.background_execute().await.is_ok());
        assert!(transport.handle.lock().await.is_none());
    }

    #[tokio::test]
    async fn keepalive_fires_through_the_requester_on_an_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let _transport = SseTransport::new(
            deps(),
            Arc::new(|_: &[serde_json::Value]| "http://127.0.0.1:1/unreachable".to_string()),
            Arc::new(|_: &str| vec![]),
            120_000,
            120_000,
            60_000,
            1_000,
            Some((
                Arc::new(move || {
                    calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    HttpRequest {
                        method: reqwest::Method::GET,
                        url: "http://127.0.0.1:1/keepalive".to_string(),
                        headers: vec![],
                        body: None,
                    }
                }),
                10,
            )),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= 2, "keepalive should fire more than once within 60ms at a 10ms interval");
    }
}
