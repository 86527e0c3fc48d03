//! Central error taxonomy.
//!
//! Every component returns typed errors that collapse into
//! [`OrchestratorError`]; the HTTP layer maps each kind to a status code via
//! the single table in [`OrchestratorError::status`]. Administrative
//! responses carry `{"error": {"kind", "message", "trace_id"}}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    #[error("authentication required")]
    Auth,

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation { .. } => "ValidationError",
            OrchestratorError::Auth => "AuthError",
            OrchestratorError::NotFound(_) => "NotFound",
            OrchestratorError::Conflict(_) => "Conflict",
            OrchestratorError::ResourceExhausted(_) => "ResourceExhausted",
            OrchestratorError::Upstream(_) => "UpstreamError",
            OrchestratorError::ContextOverflow(_) => "ContextOverflow",
            OrchestratorError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OrchestratorError::Validation { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::Auth => StatusCode::UNAUTHORIZED,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Upstream(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::ContextOverflow(_) => StatusCode::PAYLOAD_TOO_LARGE,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status();

        // No detail leakage on auth failures.
        let body = match &self {
            OrchestratorError::Auth => json!({
                "error": { "kind": self.kind(), "message": "authentication required" }
            }),
            OrchestratorError::Validation {
                field: Some(field), ..
            } => json!({
                "error": { "kind": self.kind(), "message": self.to_string(), "field": field }
            }),
            OrchestratorError::Internal(_) => {
                let trace_id = uuid::Uuid::new_v4().to_string();
                error!(trace_id = %trace_id, error = %self, "Internal error");
                json!({
                    "error": {
                        "kind": self.kind(),
                        "message": "internal error",
                        "trace_id": trace_id,
                    }
                })
            }
            _ => json!({
                "error": { "kind": self.kind(), "message": self.to_string() }
            }),
        };

        if let OrchestratorError::Auth = self {
            let mut resp = (status, Json(body)).into_response();
            resp.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
            return resp;
        }

        (status, Json(body)).into_response()
    }
}

impl From<crate::store::StoreError> for OrchestratorError {
    fn from(err: crate::store::StoreError) -> Self {
        OrchestratorError::Internal(format!("state store: {}", err))
    }
}

impl From<crate::runtime::RuntimeError> for OrchestratorError {
    fn from(err: crate::runtime::RuntimeError) -> Self {
        use crate::runtime::RuntimeError;
        match err {
            RuntimeError::ImageMissing(m) => {
                OrchestratorError::validation(format!("image missing: {}", m))
            }
            RuntimeError::PortConflict(m) => OrchestratorError::Conflict(m),
            RuntimeError::GpuUnavailable(m) | RuntimeError::QuotaExceeded(m) => {
                OrchestratorError::ResourceExhausted(m)
            }
            RuntimeError::RuntimeDown(m) => {
                OrchestratorError::ResourceExhausted(format!("container runtime unreachable: {}", m))
            }
            RuntimeError::NotFound(m) => OrchestratorError::NotFound(m),
            RuntimeError::Other(m) => OrchestratorError::Internal(m),
        }
    }
}
