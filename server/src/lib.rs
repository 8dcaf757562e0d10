//! Request-handling core for building External Adapter (EA) oracle HTTP
//! servers. A concrete adapter binary supplies an [`AdapterDefinition`] and
//! calls [`run`]; everything else — cache, subscription sets, rate
//! limiting, the request lifecycle, and the background scheduler — lives
//! here.

pub mod adapter;
pub mod background;
pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod ingress;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod requester;
pub mod router;
pub mod subscription;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::adapter::Adapter;
use crate::cache::{Cache, LocalCache, RemoteCache};
use crate::config::{CacheType, Settings};
use crate::endpoint::{CustomValidationFn, Endpoint, RequestTransformFn};
use crate::rate_limit::{resolve_allocations, RateLimiter};
use crate::requester::Requester;
use crate::router::CustomRouterFn;
use crate::subscription::SubscriptionSetFactory;
use crate::transport::{Transport, TransportDeps};

/// Builds the concrete transport once its `TransportDeps` (cache handle,
/// subscription set, requester, naming) are ready. Supplied by the adapter
/// binary, one per `(endpoint, transport-name)` pair.
pub type TransportFactory = Box<dyn FnOnce(TransportDeps) -> Arc<dyn Transport> + Send>;

pub struct TransportRouteDefinition {
    pub name: String,
    pub factory: TransportFactory,
}

pub struct EndpointDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub allocation_percentage: Option<f64>,
    pub overrides: HashMap<String, String>,
    pub request_transforms: Vec<RequestTransformFn>,
    pub custom_input_validation: Option<CustomValidationFn>,
    pub transports: Vec<TransportRouteDefinition>,
    pub custom_router: Option<CustomRouterFn>,
    pub default_transport: Option<String>,
}

pub struct AdapterDefinition {
    pub name: String,
    pub default_endpoint: Option<String>,
    pub endpoints: Vec<EndpointDefinition>,
}

/// Wires a concrete [`AdapterDefinition`] to its dependencies, then serves
/// it per `EA_MODE` (spec.md §4.I "Modes") until `tokio::signal::ctrl_c()`
/// resolves.
pub async fn run(definition: AdapterDefinition, settings: Settings) -> anyhow::Result<()> {
    let settings = Arc::new(settings);

    // Kept alongside the trait object so the writer role can acquire the
    // distributed lock (`DistributedLock` is only implemented for the
    // concrete redis backend, spec.md §4.A/§9 "Reader-writer cache lock").
    let remote_cache: Option<Arc<RemoteCache>> = match settings.cache_type {
        CacheType::Local => None,
        CacheType::Redis => Some(Arc::new(RemoteCache::connect(&settings.redis_url).await?)),
    };
    let cache: Arc<dyn Cache> = match (settings.cache_type, &remote_cache) {
        (CacheType::Local, _) => Arc::new(LocalCache::new(settings.cache_max_items)),
        (CacheType::Redis, Some(remote)) => remote.clone(),
        (CacheType::Redis, None) => unreachable!(),
    };

    let subscription_factory = match settings.cache_type {
        CacheType::Local => SubscriptionSetFactory::Local { max_items: settings.cache_max_items },
        CacheType::Redis => SubscriptionSetFactory::Remote { redis_url: settings.redis_url.clone() },
    };

    let endpoint_names: Vec<String> = definition.endpoints.iter().map(|e| e.name.to_lowercase()).collect();
    let mut explicit_allocations = HashMap::new();
    for endpoint in &definition.endpoints {
        if let Some(pct) = endpoint.allocation_percentage {
            explicit_allocations.insert(endpoint.name.to_lowercase(), pct);
        }
    }
    let allocations = resolve_allocations(&endpoint_names, &explicit_allocations)?;

    let total_rpm = total_requests_per_minute(&settings);
    let rate_limiter = Arc::new(RateLimiter::new(&allocations, total_rpm, settings.rate_limiting_strategy, settings.max_http_request_queue_length));
    let requester = Arc::new(Requester::new(rate_limiter.clone(), settings.api_timeout())?);

    let mut endpoints = Vec::with_capacity(definition.endpoints.len());
    for endpoint_def in definition.endpoints {
        let mut transport_routes = Vec::with_capacity(endpoint_def.transports.len());
        for route in endpoint_def.transports {
            let subscriptions = subscription_factory.build(&definition.name, &endpoint_def.name, &route.name).await?;
            let response_cache = cache::ResponseCache::new(cache.clone(), &settings.cache_prefix, &definition.name, &endpoint_def.name, &route.name);
            let deps = TransportDeps {
                cache: response_cache,
                subscriptions,
                requester: requester.clone(),
                adapter_name: definition.name.clone(),
                endpoint_name: endpoint_def.name.clone(),
                transport_name: route.name.clone(),
                max_common_key_size: settings.max_common_key_size,
            };
            let transport = (route.factory)(deps);
            transport_routes.push((route.name, transport));
        }

        let router = router::TransportRouter::new(transport_routes, endpoint_def.custom_router, endpoint_def.default_transport)?;
        endpoints.push(Endpoint {
            name: endpoint_def.name,
            aliases: endpoint_def.aliases,
            router,
            overrides: endpoint_def.overrides,
            request_transforms: endpoint_def.request_transforms,
            custom_input_validation: endpoint_def.custom_input_validation,
        });
    }

    let adapter = Arc::new(Adapter::new(definition.name, definition.default_endpoint, endpoints, cache, rate_limiter, requester, settings.clone())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if settings.ea_mode.runs_ingress() {
        let metrics_handle = if settings.metrics_enabled || settings.experimental_metrics_enabled {
            Some(metrics::MetricsRecorder::install()?.handle())
        } else {
            None
        };
        let state = ingress::AppState {
            adapter: adapter.clone(),
            settings: settings.clone(),
            started_at: health::StartedAt::now(),
            metrics_handle,
        };
        let app = ingress::build_router(state);
        let listener = tokio::net::TcpListener::bind((settings.ea_host.as_str(), settings.ea_port)).await?;
        tracing::info!(host = %settings.ea_host, port = settings.ea_port, "ingress listening");

        let mut ingress_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = ingress_shutdown.changed().await;
                })
                .await
        }));
    }

    if settings.ea_mode.runs_background() {
        // Single writer per (adapterName, cachePrefix) across any number of
        // writer processes sharing one remote cache (spec.md §4.A
        // "Consistency", §9 "Reader-writer cache lock"). A local cache has
        // exactly one process by Invariant 6, so there's nothing to lock.
        let lock_guard = if let Some(remote) = &remote_cache {
            use crate::cache::DistributedLock;
            let lock_name = format!("{}-{}", settings.cache_prefix, adapter.name);
            Some(remote.lock(&lock_name, settings.cache_lock_duration_ms, settings.cache_lock_retries).await?)
        } else {
            None
        };

        let executor = background::BackgroundExecutor::new(&adapter, settings.background_execute_timeout());
        let background_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            executor.run(background_shutdown).await;
            drop(lock_guard);
            Ok(())
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    shutdown_tx.send(true).ok();

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// spec.md §4.C: "the chosen rate is the minimum of per-second x 60 and
/// per-minute". When no cap is configured at all, fall back to a
/// conservative default rather than an unbounded limiter; a configured cap
/// is never clamped below what the operator asked for.
fn total_requests_per_minute(settings: &Settings) -> f64 {
    let per_second_rpm = settings.rate_limit_capacity_second.map(|c| c as f64 * 60.0);
    let per_minute_rpm = settings.rate_limit_capacity_minute.map(|c| c as f64);
    let credit_rpm = settings.rate_limit_capacity.map(|c| c as f64);

    let configured = [per_second_rpm, per_minute_rpm, credit_rpm].into_iter().flatten().fold(f64::INFINITY, f64::min);

    if configured.is_finite() {
        configured.max(1.0)
    } else {
        6_000.0
    }
}
