//! Process metrics (spec.md §3 "MetricsRecorder"). A thin wrapper around a
//! Prometheus handle; installed once at startup and exposed at
//! `GET {BASE_URL}/metrics` only when enabled.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        metrics::describe_counter!("ea_http_requests_total", "Total number of inbound adapter requests");
        metrics::describe_counter!("ea_cache_hits_total", "Total number of cache-first hits");
        metrics::describe_counter!("ea_cache_misses_total", "Total number of cache misses requiring background fill");
        metrics::describe_counter!("ea_dp_requests_total", "Total number of outbound data-provider calls");
        metrics::describe_histogram!("ea_dp_request_duration_seconds", "Duration of outbound data-provider calls");
        metrics::describe_counter!("ea_rate_limiter_rejections_total", "Total number of rate limiter rejections");
        metrics::describe_counter!("ea_queue_overflow_total", "Total number of requester queue overflows");
        metrics::describe_histogram!("ea_background_execute_duration_seconds", "Duration of background_execute invocations");
        metrics::describe_counter!("ea_background_execute_errors_total", "Total number of background_execute failures");
        metrics::describe_gauge!("ea_subscription_set_size", "Current size of a transport's subscription set");

        Ok(Self { handle })
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }
}

pub async fn metrics_handler(axum::extract::State(handle): axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

pub fn record_http_request(endpoint: &str, status_code: u16) {
    metrics::counter!("ea_http_requests_total", 1, "endpoint" => endpoint.to_string(), "status" => status_code.to_string());
}

pub fn record_cache_hit(endpoint: &str) {
    metrics::counter!("ea_cache_hits_total", 1, "endpoint" => endpoint.to_string());
}

pub fn record_cache_miss(endpoint: &str) {
    metrics::counter!("ea_cache_misses_total", 1, "endpoint" => endpoint.to_string());
}
