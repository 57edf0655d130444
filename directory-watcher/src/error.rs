//! Error types for the directory watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors surfaced synchronously by watcher operations.
///
/// Failures that happen in the background (subscription setup, callback
/// errors, queue overflow) are never returned through this type. They are
/// delivered to the callback as diagnostic events instead.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Path does not exist or is not a directory.
    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Watch limit exceeded.
    #[error("watch limit exceeded: at most {limit} roots may be watched")]
    WatchLimitExceeded { limit: usize },

    /// The watcher has been closed.
    #[error("watcher is closed")]
    Closed,

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatcherError {
    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_path_message() {
        let err = WatcherError::invalid_path("/tmp/does-not-exist", "does not exist");
        assert_eq!(
            err.to_string(),
            "invalid path /tmp/does-not-exist: does not exist"
        );
    }
}
