//! Error types for batchio

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for batchio operations
pub type Result<T> = std::result::Result<T, BatchioError>;

/// Main error type for the reading side of batchio
#[derive(Error, Debug)]
pub enum BatchioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Structured framing was selected without a record identifier
    #[error("Record identifier is not set ({key})")]
    MissingRecordIdentifier { key: &'static str },

    /// Target unit count must be positive; a zero count would divide by zero
    #[error("Target unit count must be greater than 0, got {0}")]
    InvalidUnitCount(i64),

    #[error("File {path} is {length} bytes, larger than the {limit} byte in-memory limit")]
    FileTooLarge {
        path: PathBuf,
        length: u64,
        limit: u64,
    },

    /// A lifecycle method was called in a state that does not allow it
    #[error("Reader state error: {0}")]
    ReaderState(String),
}
