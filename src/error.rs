//! Error handling module
//!
//! Centralized error taxonomy and HTTP response conversion.
//!
//! Store- and router-level errors are mapped into this taxonomy at the module
//! boundaries; vendor error codes never reach the API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error taxonomy. Each kind carries the offending identifier.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// No live row for the element at the requested instant.
    #[error("{element_kind} not found: {element}")]
    NotFound {
        element_kind: &'static str,
        element: String,
    },

    /// Duplicate event id, duplicate live element, or retrograde occurred time.
    #[error("Conflict on {element_kind} {element}: {reason}")]
    Conflict {
        element_kind: &'static str,
        element: String,
        reason: String,
    },

    /// Bad event kind or action, malformed URL, out-of-range configuration.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Deadlock or network timeout that exhausted its retry budget.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The trip-switch is set; writes fail fast until an operator resets it.
    #[error("Service unavailable: event persistence is tripped")]
    Unavailable,

    /// Invariant violation. The caller logs and crashes rather than continue
    /// corrupt.
    #[error("Invariant violation: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn not_found(element_kind: &'static str, element: impl Into<String>) -> Self {
        AppError::NotFound {
            element_kind,
            element: element.into(),
        }
    }

    pub fn conflict(
        element_kind: &'static str,
        element: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        AppError::Conflict {
            element_kind,
            element: element.into(),
            reason: reason.into(),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            AppError::NotFound { element, .. } => {
                (StatusCode::NOT_FOUND, "not_found", Some(element.clone()))
            }
            AppError::Conflict { reason, .. } => {
                (StatusCode::CONFLICT, "conflict", Some(reason.clone()))
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation", Some(msg.clone())),
            AppError::Transient(msg) => {
                tracing::warn!("Transient failure surfaced to caller: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "transient", None)
            }
            AppError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None),
            AppError::Fatal(msg) => {
                tracing::error!("Invariant violation: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "fatal", None)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<crate::event_store::StoreError> for AppError {
    fn from(err: crate::event_store::StoreError) -> Self {
        use crate::event_store::StoreError;
        match err {
            StoreError::NotFound {
                element_kind,
                element,
            } => AppError::NotFound {
                element_kind,
                element,
            },
            StoreError::DuplicateElement {
                element_kind,
                element,
            } => AppError::Conflict {
                element_kind,
                element,
                reason: "element already exists".to_string(),
            },
            StoreError::DuplicateEventId(event_id) => AppError::Conflict {
                element_kind: "event",
                element: event_id.to_string(),
                reason: "event id already exists".to_string(),
            },
            StoreError::RetrogradeTime { occurred, maximum } => AppError::Conflict {
                element_kind: "event",
                element: occurred.to_rfc3339(),
                reason: format!("occurred time precedes stored maximum {}", maximum),
            },
            StoreError::InvariantViolation {
                element_kind,
                element,
            } => AppError::Fatal(format!(
                "cascade left live rows for {} {}",
                element_kind, element
            )),
            StoreError::Validation(msg) => AppError::Validation(msg),
            StoreError::MaxRetriesExceeded => {
                AppError::Transient("serialization retries exhausted".to_string())
            }
            StoreError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                AppError::Transient(e.to_string())
            }
        }
    }
}

impl From<crate::sharding::ShardError> for AppError {
    fn from(err: crate::sharding::ShardError) -> Self {
        use crate::sharding::ShardError;
        match err {
            ShardError::InvalidUrl { url, message } => {
                AppError::Validation(format!("invalid shard URL {}: {}", url, message))
            }
            ShardError::NoShard { kind, op } => {
                AppError::Validation(format!("no shard configured for {:?}/{:?}", kind, op))
            }
            ShardError::Unreachable { shard, source } => {
                AppError::Transient(format!("shard {} unreachable: {}", shard, source))
            }
            // Remote errors are forwarded in kind, annotated with the shard.
            ShardError::Remote { shard, status, body } => match status {
                404 => AppError::NotFound {
                    element_kind: "remote element",
                    element: format!("{} (shard {})", body, shard),
                },
                409 => AppError::Conflict {
                    element_kind: "remote element",
                    element: format!("shard {}", shard),
                    reason: body,
                },
                400 => AppError::Validation(format!("shard {}: {}", shard, body)),
                503 => AppError::Unavailable,
                _ => AppError::Transient(format!("shard {} returned {}: {}", shard, status, body)),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::Transient(err.to_string())
    }
}
