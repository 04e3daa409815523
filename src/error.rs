//! Error types for the database access layer.
//!
//! All failures are variants of [`DbError`], built with `thiserror`. Callers
//! distinguish "retry later" rejections from infrastructure trouble and broken
//! operations through [`DbError::kind`] instead of matching on variants.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of an error for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Admission or locking refused the request. Retry later with backoff.
    Rejected,
    /// Infrastructure is temporarily unable to serve (pool exhausted, link down).
    Unavailable,
    /// The operation itself is broken (bad SQL, bad input, internal bug).
    Failed,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Pool '{pool}' exhausted: no connection available within {waited_ms}ms")]
    PoolTimeout { pool: String, waited_ms: u64 },

    #[error("Replica '{replica}' unavailable: {reason}")]
    ReplicaUnavailable { replica: String, reason: String },

    #[error("Resource '{resource}' is locked by transaction {holder}")]
    LockConflict { resource: String, holder: String },

    #[error("Deadlock detected: transaction {transaction_id} waiting for '{resource}' would close a cycle")]
    DeadlockDetected {
        transaction_id: String,
        resource: String,
    },

    #[error("Rate limit exceeded: more than {max_requests} requests in {window_secs}s")]
    RateLimitExceeded { max_requests: usize, window_secs: u64 },

    #[error("Timed out after {waited_ms}ms waiting for a {gate} slot")]
    ConcurrencyTimeout { gate: String, waited_ms: u64 },

    #[error("Resize of pool '{pool}' to {target_size} failed: {reason}")]
    ResizeFailed {
        pool: String,
        target_size: u32,
        reason: String,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Transaction error: {message} (session: {session_id})")]
    Transaction { message: String, session_id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn pool_timeout(pool: impl Into<String>, waited: Duration) -> Self {
        Self::PoolTimeout {
            pool: pool.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn replica_unavailable(replica: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReplicaUnavailable {
            replica: replica.into(),
            reason: reason.into(),
        }
    }

    pub fn lock_conflict(resource: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::LockConflict {
            resource: resource.into(),
            holder: holder.into(),
        }
    }

    pub fn deadlock(transaction_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::DeadlockDetected {
            transaction_id: transaction_id.into(),
            resource: resource.into(),
        }
    }

    pub fn rate_limit_exceeded(max_requests: usize, window: Duration) -> Self {
        Self::RateLimitExceeded {
            max_requests,
            window_secs: window.as_secs(),
        }
    }

    pub fn concurrency_timeout(gate: impl Into<String>, waited: Duration) -> Self {
        Self::ConcurrencyTimeout {
            gate: gate.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn resize_failed(
        pool: impl Into<String>,
        target_size: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self::ResizeFailed {
            pool: pool.into(),
            target_size,
            reason: reason.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn transaction(message: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            session_id: session_id.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Classify the error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimitExceeded { .. }
            | Self::ConcurrencyTimeout { .. }
            | Self::LockConflict { .. }
            | Self::DeadlockDetected { .. } => ErrorKind::Rejected,
            Self::PoolTimeout { .. }
            | Self::ReplicaUnavailable { .. }
            | Self::ResizeFailed { .. }
            | Self::Connection { .. }
            | Self::Timeout { .. } => ErrorKind::Unavailable,
            Self::Database { .. }
            | Self::Transaction { .. }
            | Self::InvalidInput { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => ErrorKind::Failed,
        }
    }

    /// True for admission and locking refusals.
    pub fn is_rejection(&self) -> bool {
        self.kind() == ErrorKind::Rejected
    }

    /// Check if this error is a transient infrastructure failure that
    /// [`RetryPolicy`](crate::admission::RetryPolicy) may retry on its own.
    ///
    /// Pool timeouts and logical conflicts are deliberately excluded: they are
    /// returned to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ReplicaUnavailable { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::PoolTimeout {
                pool: "unknown".to_string(),
                waited_ms: 0,
            },
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Restart the pool")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the column name",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "The connection will be replaced on next acquire",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));

        let err = DbError::lock_conflict("order:42", "tx_1");
        assert_eq!(
            err.to_string(),
            "Resource 'order:42' is locked by transaction tx_1"
        );
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(DbError::internal("x").suggestion(), None);
    }

    #[test]
    fn test_rejections_are_distinct_from_failures() {
        let rejected = [
            DbError::rate_limit_exceeded(5, Duration::from_secs(1)),
            DbError::concurrency_timeout("rate limiter", Duration::from_millis(10)),
            DbError::lock_conflict("a", "tx_1"),
            DbError::deadlock("tx_2", "a"),
        ];
        for err in &rejected {
            assert_eq!(err.kind(), ErrorKind::Rejected, "{err}");
            assert!(err.is_rejection());
            assert!(!err.is_retryable());
        }

        let pool = DbError::pool_timeout("primary", Duration::from_secs(3));
        assert_eq!(pool.kind(), ErrorKind::Unavailable);
        assert!(!pool.is_retryable());

        assert_eq!(DbError::invalid_input("bad").kind(), ErrorKind::Failed);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(DbError::replica_unavailable("replica_0", "probe failed").is_retryable());
        assert!(!DbError::timeout("query", 30).is_retryable());
        assert!(!DbError::resize_failed("primary", 8, "refused").is_retryable());
    }

    #[test]
    fn test_pool_timed_out_maps_to_pool_timeout() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DbError::PoolTimeout { .. }));
    }

    #[test]
    fn test_pool_timeout_reports_millis() {
        let err = DbError::pool_timeout("primary", Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
    }
}
