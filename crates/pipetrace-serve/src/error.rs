//! API error types and response formatting.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid request parameters or payload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The ingest rate cap was exceeded.
    #[error("rate limited")]
    RateLimited {
        limit: u32,
        retry_after_secs: u64,
    },

    /// A dependency is down; used by the readiness probe.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// ClickHouse query error.
    #[error("database error: {0}")]
    Database(#[from] clickhouse::error::Error),

    /// Storage layer error.
    #[error("store error: {0}")]
    Store(#[from] pipetrace_ingest::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<pipetrace_core::Error> for ApiError {
    fn from(err: pipetrace_core::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::RateLimited {
            limit,
            retry_after_secs,
        } = self
        {
            return rate_limited_response(limit, retry_after_secs);
        }

        let (status, error, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone())),
            Self::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", Some(msg.clone()))
            }
            Self::Database(err) => {
                tracing::error!(error = %err, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    Some("A database error occurred".to_string()),
                )
            }
            Self::Store(err) => {
                tracing::error!(error = %err, "store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    Some("A storage error occurred".to_string()),
                )
            }
            Self::Serialization(err) => {
                tracing::error!(error = %err, "serialization error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serialization_error",
                    Some("A serialization error occurred".to_string()),
                )
            }
            Self::RateLimited { .. } => unreachable!("handled above"),
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

fn rate_limited_response(limit: u32, retry_after_secs: u64) -> Response {
    let body = ErrorResponse {
        error: "rate_limited".to_string(),
        message: Some(format!(
            "Ingest rate limit exceeded ({} events/s). Retry after {} seconds.",
            limit, retry_after_secs
        )),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        headers.insert(header::RETRY_AFTER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(header::HeaderName::from_static("x-ratelimit-limit"), v);
    }
    headers.insert(
        header::HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from_static("0"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_carries_headers() {
        let response = ApiError::RateLimited {
            limit: 500,
            retry_after_secs: 2,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        assert_eq!(response.headers()["x-ratelimit-limit"], "500");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_bad_request_status() {
        let response = ApiError::BadRequest("nope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
