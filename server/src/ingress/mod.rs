//! HTTP ingress (spec.md §4.J): axum router, health checks, the single
//! POST dispatch route, and the metrics endpoint.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRef, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::Instrument;

use crate::adapter::Adapter;
use crate::config::Settings;
use crate::error::AdapterError;
use crate::health::{self, StartedAt};
use crate::metrics as ea_metrics;
use crate::middleware::logging::correlation_id_middleware;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub adapter: Arc<Adapter>,
    pub settings: Arc<Settings>,
    pub started_at: StartedAt,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// `POST {BASE_URL}` body shape (spec.md §6).
#[derive(Debug, Deserialize)]
struct RequestBody {
    #[allow(dead_code)]
    id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

pub fn build_router(state: AppState) -> Router {
    let base_url = state.settings.base_url.trim_end_matches('/').to_string();
    let post_path = if base_url.is_empty() { "/".to_string() } else { base_url.clone() };
    let metrics_handle = state.metrics_handle.clone();
    let max_payload_size_limit = state.settings.max_payload_size_limit;

    let settings = state.settings.clone();
    let mut app = Router::new()
        .route(&format!("{base_url}/health"), get(health::health))
        .route(&format!("{base_url}/health/detailed"), get(health::detailed))
        .route(&post_path, post(handle_post))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(settings, correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        // MAX_PAYLOAD_SIZE_LIMIT (spec.md §6): cap the inbound body before it
        // ever reaches `handle_post`'s manual JSON parsing.
        .layer(RequestBodyLimitLayer::new(max_payload_size_limit));

    // Metrics carries its own state type (`PrometheusHandle`), so it's built
    // as a separate router and merged in rather than folded into `AppState`.
    if let Some(handle) = metrics_handle {
        let metrics_router = Router::new().route(&format!("{base_url}/metrics"), get(ea_metrics::metrics_handler)).with_state(handle);
        app = app.merge(metrics_router);
    }

    app
}

async fn handle_post(State(adapter): State<Arc<Adapter>>, headers: HeaderMap, body: Bytes) -> Response {
    match handle_post_inner(adapter, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_post_inner(adapter: Arc<Adapter>, headers: &HeaderMap, body: &[u8]) -> Result<Response, AdapterError> {
    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(AdapterError::Input(format!("unsupported content-type {content_type:?}, expected application/json")));
    }

    let parsed: RequestBody = serde_json::from_slice(body).map_err(|e| AdapterError::Input(format!("invalid JSON body: {e}")))?;

    let endpoint_name = parsed
        .data
        .get("endpoint")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| adapter.default_endpoint.clone())
        .ok_or_else(|| AdapterError::Input("request is missing \"data.endpoint\" and the adapter has no default endpoint".to_string()))?;

    let span = tracing::info_span!("handle_request", adapter = %adapter.name, endpoint = %endpoint_name);
    let handled = adapter.handle_request(&endpoint_name, parsed.data).instrument(span).await;

    match &handled {
        Ok(response) => ea_metrics::record_http_request(&endpoint_name, response.status_code),
        Err(err) => ea_metrics::record_http_request(&endpoint_name, err.status_code().as_u16()),
    }

    let response = handled?;
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    Ok((status, Json(response.body)).into_response())
}
