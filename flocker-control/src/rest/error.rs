use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Operator-facing errors. Schema violations and conflicts always surface
/// here; transient backend trouble never does (the convergence loop absorbs
/// it).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{description}")]
    BadRequest {
        description: String,
        errors: Vec<String>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("control service is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(description: impl Into<String>) -> Self {
        ApiError::BadRequest {
            description: description.into(),
            errors: Vec::new(),
        }
    }

    pub fn validation(errors: Vec<String>) -> Self {
        ApiError::BadRequest {
            description: "configuration validation failed".to_string(),
            errors,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest {
                description,
                errors,
            } => ErrorBody {
                description,
                errors,
            },
            other => ErrorBody {
                description: other.to_string(),
                errors: Vec::new(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<crate::config_store::ConfigError> for ApiError {
    fn from(err: crate::config_store::ConfigError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
