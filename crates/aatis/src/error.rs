//! Error types for aatis.

use thiserror::Error;

/// Errors raised by command handlers before they reach `anyhow`.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid {kind}: {message}")]
    InvalidArgument { kind: &'static str, message: String },
}

impl CliError {
    pub fn invalid(kind: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            kind,
            message: message.into(),
        }
    }
}
