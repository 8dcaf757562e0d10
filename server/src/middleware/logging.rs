//! Request correlation (SPEC_FULL.md §4.L). When `CORRELATION_ID_ENABLED`,
//! accepts an inbound `x-correlation-id` header or generates one, and
//! attaches it to the request's tracing span; otherwise the request is
//! traced without a correlation id (spec.md §6).

use std::sync::Arc;

use axum::{extract::{Request, State}, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;

use crate::config::Settings;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

pub async fn correlation_id_middleware(State(settings): State<Arc<Settings>>, mut request: Request, next: Next) -> Response {
    if !settings.correlation_id_enabled {
        let span = tracing::info_span!("request", method = %request.method(), uri = %request.uri());
        return next.run(request).instrument(span).await;
    }

    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", correlation_id = %correlation_id, method = %request.method(), uri = %request.uri());

    request
        .headers_mut()
        .insert(CORRELATION_ID_HEADER, HeaderValue::from_str(&correlation_id).unwrap_or_else(|_| HeaderValue::from_static("invalid")));

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}
