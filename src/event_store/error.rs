//! Event Store Errors
//!
//! Error types for temporal store operations. Vendor error codes are mapped
//! into this taxonomy here and do not leak past the store boundary.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Errors that can occur in the temporal event store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live row for the element at the event's occurred time
    #[error("{element_kind} not found: {element}")]
    NotFound {
        element_kind: &'static str,
        element: String,
    },

    /// A live row for the element already exists
    #[error("{element_kind} already exists: {element}")]
    DuplicateElement {
        element_kind: &'static str,
        element: String,
    },

    /// The event id is already registered in the transaction time index
    #[error("Event id already exists: {0}")]
    DuplicateEventId(Uuid),

    /// The event's occurred time precedes the maximum transaction time on record
    #[error("Occurred time {occurred} precedes stored maximum {maximum}")]
    RetrogradeTime {
        occurred: DateTime<Utc>,
        maximum: DateTime<Utc>,
    },

    /// A remove cascade left a live dependent row behind
    #[error("Cascade left live rows referencing {element_kind} {element}")]
    InvariantViolation {
        element_kind: &'static str,
        element: String,
    },

    /// Semantically invalid event data (includes vendor null-column errors)
    #[error("Invalid event data: {0}")]
    Validation(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Serialization retries exceeded for a deadlocked transaction
    #[error("Maximum retries exceeded for transactional operation")]
    MaxRetriesExceeded,
}

impl StoreError {
    /// Check if this error is in the deadlock/serialization class and worth
    /// retrying in a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .map(|code| code == "40001" || code == "40P01")
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // 23502: not_null_violation. Malformed element data, not a store
            // failure.
            if db.code().as_deref() == Some("23502") {
                return StoreError::Validation(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = StoreError::NotFound {
            element_kind: "user",
            element: "alice".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_max_retries_display() {
        let err = StoreError::MaxRetriesExceeded;
        assert!(err.to_string().contains("retries"));
    }
}
