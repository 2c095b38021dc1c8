// src/error.rs

//! Unified error handling for the crawler.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for crawler operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Why an upstream account can no longer be looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    Suspended,
    NotFound,
}

impl Unavailable {
    /// Placeholder display name used for accounts that cannot be hydrated.
    pub fn placeholder_name(&self) -> &'static str {
        match self {
            Unavailable::Suspended => "SUSPENDED",
            Unavailable::NotFound => "NOT FOUND",
        }
    }
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.placeholder_name())
    }
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Addressed job or account does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream quota exhausted
    #[error("Rate limited by upstream API (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Transient upstream failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Suspended or deleted account
    #[error("Account {account} unavailable: {reason}")]
    AccountUnavailable { account: String, reason: Unavailable },

    /// Tick requested for a job that already finished
    #[error("Job was already done: {0}")]
    AlreadyComplete(String),

    /// Store write or read failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Optimistic transaction lost a race; retried by the store
    #[error("Transaction conflict on {0}")]
    Conflict(String),

    /// Bulk write exceeded the per-batch ceiling
    #[error("Batch of {size} operations exceeds limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    /// Caller may not perform the operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Call did not finish within its time bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Surrounding request was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// AWS S3 error
    #[error("S3 error: {0}")]
    S3(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a not-found error.
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    /// Create a persistence error.
    pub fn persistence(message: impl fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }

    /// Create an upstream error.
    pub fn upstream(message: impl fmt::Display) -> Self {
        Self::Upstream(message.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the next scheduled tick is expected to get past this error
    /// without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited { .. }
                | AppError::Upstream(_)
                | AppError::Timeout(_)
                | AppError::Conflict(_)
                | AppError::Http(_)
        )
    }
}
