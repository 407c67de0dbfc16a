//! WolfShard Error Types

use thiserror::Error;

/// Result type alias for WolfShard operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfShard error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Persistence repository errors
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Registry storage error: {0}")]
    Registry(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    // Cluster metadata errors
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Duplicate event handler for key prefix {0}")]
    DuplicateHandler(String),

    // Pipeline errors
    #[error("Split by unique key failed on table `{table}` (unique key `{unique_key}`): {reason}")]
    SplitByUniqueKey {
        table: String,
        unique_key: String,
        reason: String,
    },

    #[error("Invalid ingest position: {0}")]
    InvalidPosition(String),

    #[error("Inventory dump failed on {table}: {reason}")]
    Ingest { table: String, reason: String },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Build a split failure for a table, keeping the unique key name for diagnostics
    pub fn split_by_unique_key(
        table: impl Into<String>,
        unique_key: Option<&str>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::SplitByUniqueKey {
            table: table.into(),
            unique_key: unique_key.unwrap_or_default().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Repository(_) | Error::Registry(_) | Error::Timeout(_) | Error::Network(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Registry(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_error_keeps_table_and_key() {
        let err = Error::split_by_unique_key("t_order_0", Some("order_id"), "connection reset");
        match &err {
            Error::SplitByUniqueKey { table, unique_key, .. } => {
                assert_eq!(table, "t_order_0");
                assert_eq!(unique_key, "order_id");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("t_order_0"));

        let err = Error::split_by_unique_key("t_log", None, "boom");
        assert!(matches!(err, Error::SplitByUniqueKey { ref unique_key, .. } if unique_key.is_empty()));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("lock".into()).is_retryable());
        assert!(!Error::MissingConfiguration("rule".into()).is_retryable());
    }
}
