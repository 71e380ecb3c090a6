//! JSON error responses for the HTTP surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::coordinator::{CoordinatorError, PushSummary};
use crate::registry::RegistryError;

/// An error rendered as `{"error": message}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// APNS refused or could not be reached.
    Upstream {
        message: String,
        summary: Option<PushSummary>,
    },
    Internal(String),
}

impl ApiError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} not found"))
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::UnknownTopic(topic) => Self::not_found(topic),
            CoordinatorError::InvalidToken(_) | CoordinatorError::InvalidOwner => {
                Self::BadRequest(e.to_string())
            }
            CoordinatorError::Closed(_) => Self::Upstream {
                message: e.to_string(),
                summary: None,
            },
            CoordinatorError::PushFailed { error, summary } => Self::Upstream {
                message: error.to_string(),
                summary: Some(summary),
            },
            CoordinatorError::Storage(e) => {
                warn!(error = %e, "Token store error");
                Self::Internal("internal error".to_string())
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            Self::Upstream {
                message,
                summary: Some(summary),
            } => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": message, "outcomes": summary.outcomes }),
            ),
            Self::Upstream { message, .. } => {
                (StatusCode::BAD_GATEWAY, json!({ "error": message }))
            }
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
            }
        };
        (status, Json(body)).into_response()
    }
}
