use thiserror::Error;

use crate::manager::ManagerId;

pub type CoreResult<T> = Result<T, CoreError>;

/// Failure taxonomy shared across every layer. Each variant maps to a distinct
/// task outcome, so callers can tell "the command exited non-zero" apart from
/// "the command claimed success but nothing changed".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("{manager}: capability not supported: {operation}")]
    Unsupported {
        manager: ManagerId,
        operation: String,
    },
    #[error("{manager}: detection failed: {message}")]
    DetectionFailed {
        manager: ManagerId,
        message: String,
    },
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("output parse failed: {0}")]
    ParseFailed(String),
    #[error("post-action validation found no state change for '{package}'")]
    ValidationMismatch { package: String },
    #[error("cancelled")]
    Cancelled,
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn unsupported(manager: ManagerId, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            manager,
            operation: operation.into(),
        }
    }

    pub fn detection(manager: ManagerId, message: impl Into<String>) -> Self {
        Self::DetectionFailed {
            manager,
            message: message.into(),
        }
    }
}

/// Validates a user-supplied package identifier before it is ever placed in an
/// argument vector. Rejects anything that could be misread as a flag.
pub fn validate_package_name(name: &str) -> CoreResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput(
            "package identifier cannot be empty".to_string(),
        ));
    }
    if trimmed.starts_with('-') {
        return Err(CoreError::InvalidInput(
            "package identifier cannot start with '-'".to_string(),
        ));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidInput(
            "package identifier cannot contain whitespace".to_string(),
        ));
    }
    if trimmed.len() > 256 {
        return Err(CoreError::InvalidInput(
            "package identifier exceeds 256 characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_package_name("ripgrep").is_ok());
        assert!(validate_package_name("@scope/pkg").is_ok());
    }

    #[test]
    fn rejects_flag_like_and_whitespace_names() {
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name("--force").is_err());
        assert!(validate_package_name("two words").is_err());
        assert!(validate_package_name(&"x".repeat(300)).is_err());
    }
}
