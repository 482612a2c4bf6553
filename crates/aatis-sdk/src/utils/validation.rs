//! Validation Utilities

use thiserror::Error;

/// Validation error types
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    #[error("Field required: {0}")]
    Required(String),
}

/// Validate a rule id or capability name
///
/// Valid IDs are:
/// - 1-128 characters
/// - Lowercase alphanumeric with hyphens and underscores
/// - Must start with a letter
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    let Some(first) = id.chars().next() else {
        return Err(ValidationError::Required("ID cannot be empty".into()));
    };

    if id.len() > 128 {
        return Err(ValidationError::InvalidId(
            "ID must be 128 characters or less".into(),
        ));
    }

    if !first.is_ascii_lowercase() {
        return Err(ValidationError::InvalidId(
            "ID must start with a lowercase letter".into(),
        ));
    }

    for (i, c) in id.chars().enumerate() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
            return Err(ValidationError::InvalidId(format!(
                "Invalid character '{}' at position {}",
                c, i
            )));
        }
    }

    // Cannot end with hyphen or underscore
    if id.ends_with('-') || id.ends_with('_') {
        return Err(ValidationError::InvalidId(
            "ID cannot end with hyphen or underscore".into(),
        ));
    }

    Ok(())
}
