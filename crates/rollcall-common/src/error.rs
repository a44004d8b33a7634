//! Common error types for Rollcall components.

use thiserror::Error;

/// Result alias used throughout Rollcall
pub type RollcallResult<T> = Result<T, RollcallError>;

/// Common errors across Rollcall components
#[derive(Debug, Error)]
pub enum RollcallError {
    /// Empty required field or malformed input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced entity missing, unregistered type, historic delete,
    /// duplicate leader
    #[error("Conflict: {0}")]
    DomainConflict(String),

    /// Persistence gateway failure
    #[error("Store error: {0}")]
    Store(String),

    /// Push to one recipient failed
    #[error("Delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl RollcallError {
    /// Shorthand for `InvalidArgument`
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Shorthand for `DomainConflict`
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::DomainConflict(message.into())
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::DomainConflict(_) => 409,
            Self::Store(_) => 503,
            Self::Delivery { .. } => 502,
            Self::Config(_) => 500,
            Self::Timeout(_) => 504,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Delivery { .. } | Self::Timeout(_)
        )
    }
}

/// Fails with `InvalidArgument` when `value` is empty or whitespace.
pub fn require_text(value: &str, what: &str) -> RollcallResult<()> {
    if value.trim().is_empty() {
        return Err(RollcallError::invalid(format!("{what} can not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RollcallError::invalid("x").status_code(), 400);
        assert_eq!(RollcallError::conflict("x").status_code(), 409);
        assert_eq!(RollcallError::Store("x".into()).status_code(), 503);
    }

    #[test]
    fn test_retryable() {
        assert!(RollcallError::Store("down".into()).is_retryable());
        assert!(!RollcallError::conflict("leader").is_retryable());
        assert!(!RollcallError::invalid("name").is_retryable());
    }

    #[test]
    fn test_require_text() {
        assert!(require_text("svc", "type").is_ok());
        assert!(matches!(
            require_text("  ", "type"),
            Err(RollcallError::InvalidArgument(_))
        ));
    }
}
