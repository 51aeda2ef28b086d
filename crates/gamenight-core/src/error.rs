//! Error types for gamenight-core
//!
//! Each tier has its own error enum so callers can tell which failures are
//! swallowed (durable store), isolated (single backend query) or surfaced
//! (subscriptions, whole aggregate).

use std::path::PathBuf;
use thiserror::Error;

/// Durable key/value tier errors.
///
/// Never reach UI code: the tiered cache logs them, counts them and falls
/// back to a miss or a no-op write.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Durable storage is not available on this platform")]
    Unavailable,

    #[error("Durable storage I/O failed: {message}")]
    Io { message: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open cache database: {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors reported by the hosted backend collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Query on table '{table}' failed: {message}")]
    Query { table: String, message: String },

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Session lookup failed: {0}")]
    Session(String),
}

impl BackendError {
    pub fn query(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            table: table.into(),
            message: message.into(),
        }
    }
}

/// Failure of a whole derived-data computation.
///
/// Cloneable so a single result can be handed to every caller that joined
/// the same in-flight computation.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("No authenticated user")]
    NotAuthenticated,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Configuration file errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::query("events", "permission denied");
        assert_eq!(
            err.to_string(),
            "Query on table 'events' failed: permission denied"
        );
    }

    #[test]
    fn test_fetch_error_from_backend() {
        let err: FetchError = BackendError::Unreachable("offline".into()).into();
        assert!(matches!(err, FetchError::Backend(BackendError::Unreachable(_))));
        assert_eq!(err.to_string(), "Backend unreachable: offline");
    }
}
