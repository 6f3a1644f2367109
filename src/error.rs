//! Error types for the ETL engine.
//!
//! Every failure is classified by how far it reaches: run-scoped errors
//! (`Config`, `NoMatch`) abort a whole run, table-scoped errors (`Schema`,
//! `Database`, `RetryExhausted`, `Timeout`) fail a single table, and
//! `TransientIo` is the only class that triggers a retry with backoff.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("No database matches pattern '{pattern}'")]
    NoMatch { pattern: String },

    #[error("Schema error: {message} (table: {table})")]
    Schema { message: String, table: String },

    #[error("Transient I/O error: {message}")]
    TransientIo { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLSTATE or driver error code when the driver reports one
        code: Option<String>,
    },

    #[error("Retries exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout { operation: String, elapsed_secs: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EtlError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a name resolution error for a pattern that matched nothing.
    pub fn no_match(pattern: impl Into<String>) -> Self {
        Self::NoMatch {
            pattern: pattern.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, table: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            table: table.into(),
        }
    }

    /// Create a transient I/O error with a helpful suggestion.
    pub fn transient(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a non-transient database error.
    pub fn database(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            code,
        }
    }

    /// Create a retry exhausted error.
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::TransientIo { suggestion, .. } => Some(suggestion),
            Self::NoMatch { .. } => Some("Check the pattern against SHOW DATABASES on the server"),
            _ => None,
        }
    }

    /// Check if the failed operation may be repeated with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Check if a whole table may be re-attempted after this error.
    pub fn allows_table_reattempt(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::RetryExhausted { .. })
    }
}

/// MySQL server error numbers that indicate a transient condition.
const MYSQL_TRANSIENT_ERRORS: &[u16] = &[
    1040, // too many connections
    1205, // lock wait timeout
    1213, // deadlock
    2006, // server has gone away
    2013, // lost connection during query
];

/// SQLite primary result codes for a busy or locked database.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

fn is_transient_database_error(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    if let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        return MYSQL_TRANSIENT_ERRORS.contains(&mysql_err.number());
    }
    if db_err
        .try_downcast_ref::<sqlx::sqlite::SqliteError>()
        .is_some()
    {
        return db_err
            .code()
            .and_then(|c| c.parse::<i64>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
    }
    false
}

/// Convert sqlx errors to EtlError.
impl From<sqlx::Error> for EtlError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => EtlError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                if is_transient_database_error(db_err.as_ref()) {
                    EtlError::transient(
                        db_err.message(),
                        "The server reported a lock or connection condition; the operation will be retried",
                    )
                } else {
                    let code = db_err.code().map(|c| c.to_string());
                    EtlError::database(db_err.message(), code)
                }
            }
            sqlx::Error::PoolTimedOut => EtlError::transient(
                "Timed out acquiring a pooled connection",
                "Reduce MAX_WORKERS or raise POOL_ACQUIRE_TIMEOUT_SECONDS",
            ),
            sqlx::Error::PoolClosed => EtlError::cancelled("connection pool is closed"),
            sqlx::Error::Io(io_err) => EtlError::transient(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => EtlError::transient(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => EtlError::transient(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::RowNotFound => EtlError::database("No rows returned", None),
            sqlx::Error::TypeNotFound { type_name } => {
                EtlError::internal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                EtlError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => EtlError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                EtlError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => EtlError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => EtlError::transient(
                "Database worker crashed",
                "The connection will be re-established on retry",
            ),
            _ => EtlError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for ETL operations.
pub type EtlResult<T> = Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EtlError::no_match("backup_*");
        assert_eq!(err.to_string(), "No database matches pattern 'backup_*'");

        let err = EtlError::schema("no primary or unique key", "orders");
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(EtlError::transient("connection reset", "retry").is_retryable());
        assert!(!EtlError::timeout("table orders", 30).is_retryable());
        assert!(!EtlError::schema("bad", "t").is_retryable());
        assert!(!EtlError::retry_exhausted("fetch", 3, "reset").is_retryable());
    }

    #[test]
    fn test_table_reattempt_classes() {
        assert!(EtlError::retry_exhausted("fetch", 3, "reset").allows_table_reattempt());
        assert!(EtlError::transient("reset", "retry").allows_table_reattempt());
        assert!(!EtlError::timeout("table", 5).allows_table_reattempt());
        assert!(!EtlError::schema("bad", "t").allows_table_reattempt());
        assert!(!EtlError::config("bad").allows_table_reattempt());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: EtlError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: EtlError = sqlx::Error::Io(io).into();
        assert!(matches!(err, EtlError::TransientIo { .. }));
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err: EtlError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_retryable());
    }
}
