//! Error types for the Ratewarden library.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No rate limit is configured under this route key
    #[error("No rate limiter configured for route '{0}'")]
    UnknownRoute(String),

    /// The caller exceeded the limit of the route
    #[error("Rate limit exceeded for route '{route}' (client '{client}'), retry after {retry_after}")]
    LimitExceeded {
        route: String,
        client: String,
        retry_after: DateTime<Utc>,
    },

    /// The request asks for more tokens than the policy can ever grant
    #[error("Cannot consume {requested} tokens on route '{route}', the limit is {limit}")]
    InvalidTokens {
        route: String,
        requested: u32,
        limit: u32,
    },

    /// The state store misbehaved
    #[error("Store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Service settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// JSON (state snapshot) errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// Whether this error is a limit rejection rather than a failure.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, WardenError::LimitExceeded { .. })
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
