//! Error types for circle coordination

use thiserror::Error;

/// Message shown to callers when something we did not anticipate fails
pub const GENERIC_FAILURE: &str = "Something went wrong, please try again later";

/// Message shown when the backing store cannot be reached
pub const BACKEND_UNAVAILABLE: &str = "Service is unavailable, please try again later";

#[derive(Error, Debug)]
pub enum CircleError {
    /// Malformed or out-of-range input
    #[error("{0}")]
    Validation(String),

    /// Unknown code, circle or membership
    #[error("{0}")]
    NotFound(String),

    /// Input is well formed but breaks a business rule
    #[error("{0}")]
    Conflict(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Coarse category of a [`CircleError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    BackendUnavailable,
    Unexpected,
}

impl CircleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CircleError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CircleError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CircleError::Conflict(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CircleError::Validation(_) => ErrorKind::Validation,
            CircleError::NotFound(_) => ErrorKind::NotFound,
            CircleError::Conflict(_) => ErrorKind::Conflict,
            CircleError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            CircleError::Database(_) | CircleError::Io(_) | CircleError::Unexpected(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Business-rule failures that are reported as-is and never logged as errors
    pub fn is_expected(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict
        )
    }

    /// Whether the same call could succeed later without changing its input
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnavailable | ErrorKind::Unexpected
        )
    }

    /// The single human-readable string handed back to callers.
    ///
    /// Unexpected failures never leak their internals.
    pub fn user_message(&self) -> String {
        match self {
            CircleError::Validation(msg)
            | CircleError::NotFound(msg)
            | CircleError::Conflict(msg) => msg.clone(),
            CircleError::BackendUnavailable(_) => BACKEND_UNAVAILABLE.to_string(),
            CircleError::Database(_) | CircleError::Io(_) | CircleError::Unexpected(_) => {
                GENERIC_FAILURE.to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CircleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_error_display() {
        let err = CircleError::not_found("Circle not found");
        assert_eq!(format!("{}", err), "Circle not found");

        let err = CircleError::BackendUnavailable("pool closed".to_string());
        assert_eq!(format!("{}", err), "Backend unavailable: pool closed");

        let err = CircleError::Unexpected("boom".to_string());
        assert_eq!(format!("{}", err), "Unexpected error: boom");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(CircleError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(CircleError::conflict("x").kind(), ErrorKind::Conflict);
        let db: CircleError = sqlx::Error::Configuration("test".into()).into();
        assert_eq!(db.kind(), ErrorKind::Unexpected);
    }

    #[test]
    fn test_expected_errors_are_not_retryable() {
        for err in [
            CircleError::validation("bad"),
            CircleError::not_found("missing"),
            CircleError::conflict("full"),
        ] {
            assert!(err.is_expected());
            assert!(!err.is_retryable());
        }
        assert!(CircleError::BackendUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn test_user_message_hides_internals() {
        let db: CircleError = sqlx::Error::Configuration("secret dsn".into()).into();
        assert_eq!(db.user_message(), GENERIC_FAILURE);
        assert!(!db.user_message().contains("secret"));

        let err = CircleError::BackendUnavailable("no url".into());
        assert_eq!(err.user_message(), BACKEND_UNAVAILABLE);

        let err = CircleError::conflict("This circle is full");
        assert_eq!(err.user_message(), "This circle is full");
    }

    #[test]
    fn test_database_error_from_sqlx() {
        let sqlx_err = sqlx::Error::Configuration("test".into());
        let err: CircleError = sqlx_err.into();
        assert!(matches!(err, CircleError::Database(_)));
    }
}
