//! Error types for lock and rate limiter storage operations.

use thiserror::Error;

/// Main error type for db-throttle operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Bad constructor or call parameters
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Non-positive or sub-second TTL
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// The lock is owned by someone else
    #[error("Lock conflicted: {0}")]
    LockConflicted(String),

    /// The caller's own lifetime on the lock ran out
    #[error("Lock expired: {0}")]
    LockExpired(String),

    /// The lock row is still present after a release
    #[error("Failed to release lock: {0}")]
    LockReleasing(String),

    /// Corrupt limiter payload
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThrottleError {
    /// Whether this error is an ordinary contention outcome.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ThrottleError::LockConflicted(_))
    }

    /// Whether a database error is a unique-key violation.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for ThrottleError {
    fn from(err: config::ConfigError) -> Self {
        ThrottleError::Config(err.to_string())
    }
}

/// Result type alias for db-throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
