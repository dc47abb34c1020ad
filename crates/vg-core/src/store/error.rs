//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record not found.
    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// Uniqueness violation.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Conditional write precondition failed.
    #[error("Conditional write conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend connection error.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Query error: {0}")]
    Query(String),
}

impl StoreError {
    /// Convenience constructor for missing records.
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        StoreError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "unknown".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    StoreError::Duplicate(db_err.message().to_string())
                } else {
                    StoreError::Query(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => StoreError::Connection("pool timed out".to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}
