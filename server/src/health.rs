//! Health endpoints (spec.md §4.J, §6): the minimal `{message, version}`
//! shape the wire contract requires at the bare route, plus a richer
//! `/health/detailed` payload for operators (SPEC_FULL.md §6).

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::config::{CacheType, EaMode, Settings};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    message: &'static str,
    version: &'static str,
}

/// `GET {BASE_URL}/health` — the wire contract's minimal shape.
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { message: "OK", version: env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    message: &'static str,
    version: &'static str,
    mode: &'static str,
    cache_backend: &'static str,
    uptime_seconds: u64,
}

#[derive(Clone)]
pub struct StartedAt(pub Arc<Instant>);

impl StartedAt {
    pub fn now() -> Self {
        Self(Arc::new(Instant::now()))
    }
}

/// `GET {BASE_URL}/health/detailed` — operator-facing detail beyond the
/// wire contract's minimal shape.
pub async fn detailed(State(settings): State<Arc<Settings>>, State(started_at): State<StartedAt>) -> (StatusCode, Json<DetailedHealthResponse>) {
    let mode = match settings.ea_mode {
        EaMode::Reader => "reader",
        EaMode::Writer => "writer",
        EaMode::ReaderWriter => "reader-writer",
    };
    let cache_backend = match settings.cache_type {
        CacheType::Local => "local",
        CacheType::Redis => "redis",
    };

    (
        StatusCode::OK,
        Json(DetailedHealthResponse {
            message: "OK",
            version: env!("CARGO_PKG_VERSION"),
            mode,
            cache_backend,
            uptime_seconds: started_at.0.elapsed().as_secs(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = health().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.message, "OK");
    }
}
