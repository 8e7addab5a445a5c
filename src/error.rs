//! Centralized error types for threadline.
//!
//! Malformed input never shows up here: bad headers, undecodable
//! conversation indexes and duplicate IDs are recorded as anomalies
//! (see [`crate::model::anomaly`]). An `EngineError` means the run
//! produced nothing and must be retried wholesale.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the threadline library.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An upstream record could not be decoded (driver-side JSON input).
    #[error("Invalid input record at line {line}: {reason}")]
    InvalidInput { line: usize, reason: String },

    /// A banner/footer pattern failed to compile.
    #[error("Invalid pattern '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled at a checkpoint boundary.
    #[error("Run cancelled")]
    Cancelled,

    /// Output rows could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `EngineError::io`).
impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
