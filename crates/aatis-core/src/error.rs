//! Error types for aatis-core.

use thiserror::Error;

use crate::types::MemoryId;

/// Result type alias using aatis-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for AATIS operations
#[derive(Error, Debug)]
pub enum Error {
    // Database errors
    #[cfg(feature = "db")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Vector index errors
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    // Lookup errors
    #[error("Memory record not found: {0}")]
    MemoryNotFound(MemoryId),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Stored data that no longer parses
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a dimension mismatch error
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Check if this error came from index misuse
    pub fn is_index_error(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. } | Self::InvalidVector(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
