//! Error types for sqlcontext
//!
//! Every fallible operation in the crate returns `DataError`.
//! Driver errors coming out of sqlx are classified on conversion so
//! callers (and the checkout validator) can tell transient database
//! failures apart from mapping or programming defects.

use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum DataError {
    /// Operation invoked on a context whose connection was released
    #[error("Data context has been disposed")]
    Disposed,

    /// Database unreachable or rejected the request
    #[error("Database error: {0}")]
    Connectivity(#[source] sqlx::Error),

    /// Command did not finish within the configured command timeout
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Row shape does not match the requested type or split configuration
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Statement expected to return exactly one row returned none
    #[error("Sequence contains no rows")]
    NoRows,

    /// Statement expected to return exactly one row returned several
    #[error("Sequence contains more than one row")]
    MultipleRows,

    /// Invalid transaction usage (nested begin, mismatched handle, ...)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Feature the backing driver cannot express
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Configuration error (bad connection string, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DataError {
    /// Whether this error came from the database itself.
    ///
    /// Database-level errors are transient from the checkout validator's
    /// point of view: they are logged and the next tick proceeds. Anything
    /// else indicates a defect and is propagated.
    pub fn is_database_error(&self) -> bool {
        matches!(self, DataError::Connectivity(_) | DataError::Timeout(_))
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(source) => DataError::Config(source.to_string()),
            sqlx::Error::RowNotFound => DataError::NoRows,
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => DataError::Mapping(err.to_string()),
            other => DataError::Connectivity(other),
        }
    }
}

impl From<config::ConfigError> for DataError {
    fn from(err: config::ConfigError) -> Self {
        DataError::Config(err.to_string())
    }
}

/// Result type alias using DataError
pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_are_classified() {
        assert!(matches!(
            DataError::from(sqlx::Error::RowNotFound),
            DataError::NoRows
        ));
        assert!(matches!(
            DataError::from(sqlx::Error::ColumnNotFound("name".to_string())),
            DataError::Mapping(message) if message.contains("name")
        ));
        assert!(matches!(
            DataError::from(sqlx::Error::PoolTimedOut),
            DataError::Connectivity(_)
        ));
    }

    #[test]
    fn only_connectivity_and_timeouts_are_database_errors() {
        assert!(DataError::Connectivity(sqlx::Error::PoolClosed).is_database_error());
        assert!(DataError::Timeout(Duration::from_secs(1)).is_database_error());
        assert!(!DataError::Disposed.is_database_error());
        assert!(!DataError::Config("bad".to_string()).is_database_error());
        assert!(!DataError::Mapping("bad".to_string()).is_database_error());
    }
}
