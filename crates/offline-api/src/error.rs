//! API error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use offline_core::CoreError;
use offline_fetch::FetchError;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Upstream error: {0}")]
    Fetch(#[from] FetchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, detail) = match &self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), Value::Null)
            }
            ApiError::Core(e) => match e {
                CoreError::ManifestFetchFailed { failures, .. } => (
                    StatusCode::BAD_GATEWAY,
                    "MANIFEST_FETCH_FAILED",
                    e.to_string(),
                    json!(failures),
                ),
                CoreError::Busy(_) | CoreError::NothingToActivate => {
                    (StatusCode::CONFLICT, "CONFLICT", e.to_string(), Value::Null)
                }
                CoreError::InvalidRequest(msg) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), Value::Null)
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    e.to_string(),
                    Value::Null,
                ),
            },
            ApiError::Fetch(e) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
                e.to_string(),
                Value::Null,
            ),
        };

        let body = axum::Json(json!({
            "error": {
                "code": code,
                "message": message,
                "detail": detail
            }
        }));

        (status, body).into_response()
    }
}
