//! Binary entry point (SPEC_FULL.md §4.M). Wires a small illustrative
//! "echo-price" adapter so the crate is runnable end to end; a downstream
//! adapter crate would instead depend on `ea_core` as a library and supply
//! its own [`ea_core::AdapterDefinition`].

use std::collections::HashMap;
use std::sync::Arc;

use ea_core::config::Settings;
use ea_core::transport::http::HttpBatchTransport;
use ea_core::transport::{PreparedBatch, TransportDeps, TransportResult};
use ea_core::{AdapterDefinition, EndpointDefinition, TransportRouteDefinition};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = Settings::from_env()?;
    let definition = echo_price_adapter(&settings);

    ea_core::run(definition, settings).await
}

fn init_tracing() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "warn".to_string()
        }
    });

    let env_filter = tracing_subscriber::EnvFilter::try_new(&log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);

    if cfg!(debug_assertions) {
        subscriber.init();
    } else {
        subscriber.json().init();
    }
}

/// A minimal single-endpoint, single-transport adapter: `price` batches
/// `{base, quote}` pairs to `ECHO_PRICE_DP_URL` (defaulting to a loopback
/// address nothing is listening on, since no real data provider is in
/// scope) and expects back `{"prices":[{"pair":"BASE/QUOTE","price":f64}]}`.
fn echo_price_adapter(settings: &Settings) -> AdapterDefinition {
    AdapterDefinition {
        name: settings.adapter_name.clone(),
        default_endpoint: Some("price".to_string()),
        endpoints: vec![EndpointDefinition {
            name: "price".to_string(),
            aliases: vec!["crypto".to_string()],
            allocation_percentage: None,
            overrides: HashMap::new(),
            request_transforms: vec![],
            custom_input_validation: None,
            transports: vec![price_batch_transport(settings)],
            custom_router: None,
            default_transport: None,
        }],
    }
}

fn price_batch_transport(settings: &Settings) -> TransportRouteDefinition {
    let dp_url = std::env::var("ECHO_PRICE_DP_URL").unwrap_or_else(|_| "http://127.0.0.1:9/prices".to_string());
    let warmup_ttl = settings.warmup_subscription_ttl_ms;
    let cache_max_age = settings.cache_max_age_ms;
    let min_period = settings.background_execute_ms_http;

    TransportRouteDefinition {
        name: ea_core::router::DEFAULT_TRANSPORT_NAME.to_string(),
        factory: Box::new(move |deps: TransportDeps| {
            let prepare_requests = Arc::new(move |params: &[serde_json::Value], _settings: &serde_json::Value| {
                let pairs: Vec<String> = params
                    .iter()
                    .filter_map(|p| {
                        let base = p.get("base")?.as_str()?;
                        let quote = p.get("quote")?.as_str()?;
                        Some(format!("{base}/{quote}"))
                    })
                    .collect();
                vec![PreparedBatch {
                    params_subset: params.to_vec(),
                    request: ea_core::requester::HttpRequest {
                        method: reqwest::Method::GET,
                        url: format!("{dp_url}?pairs={}", pairs.join(",")),
                        headers: vec![],
                        body: None,
                    },
                    cost: 1,
                }]
            });

            let parse_response = Arc::new(|_params: &[serde_json::Value], response: &ea_core::requester::ProviderResponse| {
                let prices = response
                    .body
                    .get("prices")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .ok_or_else(|| "missing \"prices\" array in provider response".to_string())?;

                let mut results = Vec::with_capacity(prices.len());
                for entry in prices {
                    let pair = entry.get("pair").and_then(|v| v.as_str()).ok_or("price entry missing \"pair\"")?;
                    let price = entry.get("price").and_then(|v| v.as_f64()).ok_or("price entry missing \"price\"")?;
                    let Some((base, quote)) = pair.split_once('/') else { continue };
                    results.push(TransportResult {
                        params: serde_json::json!({"base": base, "quote": quote}),
                        value: serde_json::json!({"result": price}),
                        provider_indicated_time_unix_ms: None,
                    });
                }
                Ok(results)
            });

            Arc::new(HttpBatchTransport::new(deps, prepare_requests, parse_response, warmup_ttl, cache_max_age, min_period))
        }),
    }
}
