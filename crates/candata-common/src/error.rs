//! Error types shared across candata crates

use thiserror::Error;

/// Result type alias for shared candata helpers
pub type Result<T> = std::result::Result<T, CandataError>;

/// Workspace-level error type
#[derive(Error, Debug)]
pub enum CandataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid value for environment variable {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}
