use thiserror::Error;

/// Closed error taxonomy for the service adapters.
///
/// Only `RateLimited` and `Transient` are retried; the rest have bespoke
/// handlers in the engine.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Credentials invalid or expired; fatal for the pair pass
    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    /// Server asked us to slow down (429/503); retried with backoff
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The server rejected the continuation token; clear it, downgrade to
    /// snapshot, suppress deletions
    #[error("Sync token invalidated: {0}")]
    TokenInvalidated(String),

    /// Event id or resource href does not exist on the server
    #[error("Not found: {0}")]
    NotFound(String),

    /// Version precondition failed on a conditional write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network or 5xx failure; retried within budget, then reported
    #[error("Transient error: {0}")]
    Transient(String),

    /// Schema violation or programmer error; aborts the session
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl AdapterError {
    /// Whether the retry loop may attempt this call again
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Service layer errors - combines all error types
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    AdapterError(#[from] AdapterError),

    #[error(transparent)]
    DatabaseError(#[from] calbridge_db::error::DbError),

    #[error(transparent)]
    RfcError(#[from] calbridge_rfc::error::RfcError),

    #[error(transparent)]
    CoreError(#[from] calbridge_core::error::CoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(&'static str),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
