//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed preset data. Recoverable: the write is rejected and the caller
/// decides how to report it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("preset name must not be empty")]
    EmptyName,

    #[error("unknown application category code: '{0}'")]
    UnknownCategory(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("schedule ends before it starts")]
    InvertedSchedule,

    #[error("malformed preset record: {0}")]
    Malformed(String),
}

/// Errors that can occur in preset store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown preset name '{name}'")]
    NotFound { name: String },

    #[error("preset '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("too many presets (limit is {max})")]
    Capacity { max: usize },

    /// The preset file is absent and this store may not create it.
    #[error("preset file not found: {}", path.display())]
    Missing { path: PathBuf },

    #[error("preset store at {} is read-only", path.display())]
    ReadOnly { path: PathBuf },

    /// Durable state failed validation. Fatal: the store is never repaired
    /// automatically.
    #[error("preset storage is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode preset collection: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error signals corrupted durable state rather than a
    /// rejected request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
