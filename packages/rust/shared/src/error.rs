//! Error types for Reservoir.
//!
//! Library crates use [`ReservoirError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Reservoir operations.
#[derive(Debug, thiserror::Error)]
pub enum ReservoirError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Uniqueness constraint violated by a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Record validation error (missing localId, payload, sourceId, ...).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Match key method configuration or extraction error.
    #[error("match key error: {message}")]
    MatchKey { message: String },

    /// Malformed input stream (not valid JSON).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ReservoirError>;

impl ReservoirError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a match key error from any displayable message.
    pub fn match_key(msg: impl Into<String>) -> Self {
        Self::MatchKey {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether re-running the failed transaction may succeed.
    ///
    /// Only storage failures qualify; validation and extraction errors are
    /// deterministic and would fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Conflict(_))
    }
}
