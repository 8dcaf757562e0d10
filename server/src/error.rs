//! Structured error type shared by every request-handling component.
//!
//! Every fallible operation in the core (cache, subscription set, rate
//! limiter, requester, transports, endpoint/adapter dispatch) returns
//! `Result<T, AdapterError>`. The HTTP ingress layer is the only place an
//! `AdapterError` is turned into a response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// The error kinds recognized by the wire contract (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Content-type, missing endpoint, missing required parameter, unknown transport.
    #[error("{0}")]
    Input(String),

    /// Endpoint not registered on this adapter.
    #[error("{0}")]
    NotFound(String),

    /// Cache polling exhausted `CACHE_POLLING_MAX_RETRIES` without a hit.
    #[error("{0}")]
    Timeout(String),

    /// The data provider call failed or its response could not be parsed.
    #[error("{0}")]
    Upstream(String),

    /// The requester's bounded queue dropped the oldest waiter to admit this one.
    #[error("{0}")]
    QueueOverflow(String),

    /// Unexpected internal failure.
    #[error("{0}")]
    Internal(String),

    /// A domain invariant was violated (e.g. LWBA `bid <= mid <= ask`).
    #[error("{0}")]
    Invariant(String),
}

impl AdapterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdapterError::Input(_) => StatusCode::BAD_REQUEST,
            AdapterError::NotFound(_) => StatusCode::NOT_FOUND,
            AdapterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AdapterError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AdapterError::QueueOverflow(_) => StatusCode::TOO_MANY_REQUESTS,
            AdapterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdapterError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdapterError::Input(_) => "Input",
            AdapterError::NotFound(_) => "NotFound",
            AdapterError::Timeout(_) => "Timeout",
            AdapterError::Upstream(_) => "Upstream",
            AdapterError::QueueOverflow(_) => "QueueOverflow",
            AdapterError::Internal(_) => "Internal",
            AdapterError::Invariant(_) => "Invariant",
        }
    }
}

/// `{"status":"errored", "statusCode":4xx|5xx, "error":{"name":string, "message":string}}`
#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    #[serde(rename = "statusCode")]
    status_code: u16,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    name: &'static str,
    message: String,
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let name = self.name();
        let message = redact(&self.to_string());

        tracing::warn!(error.kind = name, error.message = %message, "request failed");

        let body = ErrorBody {
            status: "errored",
            status_code: status.as_u16(),
            error: ErrorDetail { name, message },
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AdapterError {
    fn from(err: anyhow::Error) -> Self {
        AdapterError::Internal(err.to_string())
    }
}

/// Settings marked `sensitive` are never echoed verbatim into logs or error
/// bodies. Values are matched by exact substring and blanked out.
pub fn redact(message: &str) -> String {
    crate::config::sensitive_values_snapshot()
        .into_iter()
        .fold(message.to_string(), |acc, secret| {
            if secret.is_empty() {
                acc
            } else {
                acc.replace(&secret, "***")
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(AdapterError::Input("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AdapterError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AdapterError::Timeout("x".into()).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(AdapterError::Upstream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            AdapterError::QueueOverflow("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AdapterError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
