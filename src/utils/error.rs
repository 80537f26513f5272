//! Error handling for the sweep cache.

use thiserror::Error;

/// Main error type for the cache and query layer
#[derive(Debug, Error)]
pub enum Error {
    /// Parameter set outside its declared domain
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entry or tier absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate write without overwrite
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage unreachable, directory missing, permission denied
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed artifact content
    #[error("Parse error: {0}")]
    Parse(String),

    /// Exceeded the wait bound of a shared computation
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Result store unreachable or malformed query
    #[error("Query error: {0}")]
    Query(String),

    /// The backtest closure failed
    #[error("Computation failed: {0}")]
    Compute(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether the caller may retry or degrade instead of reporting a bad request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Io(_) | Error::Query(_) | Error::Sqlite(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("toml parse error: {}", err))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(format!("toml serialize error: {}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Compute(format!("background task failed: {}", err))
    }
}

/// Result type for the sweep cache
pub type Result<T> = std::result::Result<T, Error>;
