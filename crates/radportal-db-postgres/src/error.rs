//! Error types for the PostgreSQL storage backend.

use radportal_notifications::NotificationError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for undefined table (42P01).
pub const PG_UNDEFINED_TABLE: &str = "42P01";

/// PostgreSQL error code for unique violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Checks if a sqlx error is "undefined table" (42P01).
pub fn is_undefined_table(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNDEFINED_TABLE)
}

/// Errors specific to the PostgreSQL storage backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Connection(#[from] sqlx_core::error::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A stored value could not be mapped back to a domain type.
    #[error("Corrupt row: {message}")]
    Decode { message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for NotificationError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) if has_pg_error_code(&e, PG_UNIQUE_VIOLATION) => {
                NotificationError::Storage(format!("duplicate key: {e}"))
            }
            PostgresError::Connection(e) => NotificationError::Storage(e.to_string()),
            PostgresError::Config { message } => NotificationError::InvalidConfig(message),
            PostgresError::Decode { message } => NotificationError::Storage(message),
        }
    }
}

/// Map a sqlx error straight into the engine's error type.
pub(crate) fn db_err(err: SqlxError) -> NotificationError {
    PostgresError::from(err).into()
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
