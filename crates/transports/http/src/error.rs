//! HTTP error mapping
//!
//! Engine-level failures never become HTTP failures; they travel as normal
//! run results. Everything else maps to a status code with a
//! machine-readable `code` and a human message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias for handler functions
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum ApiError {
    /// Core runtime error
    #[error(transparent)]
    Core(#[from] statabridge_core::Error),

    /// Unknown graph name for the session
    #[error("graph not found: {0}")]
    GraphNotFound(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Core(err) => err.code(),
            ApiError::GraphNotFound(_) => "graph_not_found",
        }
    }

    fn status(&self) -> StatusCode {
        match self.code() {
            "bad_request" => StatusCode::BAD_REQUEST,
            "session_not_found" | "graph_not_found" => StatusCode::NOT_FOUND,
            "session_busy" => StatusCode::CONFLICT,
            "capacity" | "engine_unavailable" | "worker_dead" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let mut body = json!({
            "code": code,
            "message": self.to_string(),
        });

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Correlate the opaque client message with the server log.
            let correlation_id = uuid::Uuid::new_v4().simple().to_string();
            tracing::error!(%correlation_id, error = %self, "internal error");
            body["correlation_id"] = json!(correlation_id);
        }
        if let ApiError::Core(statabridge_core::Error::SessionBusy { state, .. }) = &self {
            body["session_state"] = json!(state);
        }

        (status, Json(body)).into_response()
    }
}
