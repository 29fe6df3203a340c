use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendErrorCode {
    InvalidArgument,
    Internal,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    Unauthenticated,
    Unavailable,
}

impl BackendErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorCode::InvalidArgument => "backend/invalid-argument",
            BackendErrorCode::Internal => "backend/internal",
            BackendErrorCode::NotFound => "backend/not-found",
            BackendErrorCode::PermissionDenied => "backend/permission-denied",
            BackendErrorCode::FailedPrecondition => "backend/failed-precondition",
            BackendErrorCode::Unauthenticated => "backend/unauthenticated",
            BackendErrorCode::Unavailable => "backend/unavailable",
        }
    }
}

/// Error reported by one of the external collaborators (identity provider,
/// document store or messaging provider).
#[derive(Clone, Debug)]
pub struct BackendError {
    pub code: BackendErrorCode,
    message: String,
}

impl BackendError {
    pub fn new(code: BackendErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure is expected to clear up on its own (network blip,
    /// rules or indexes still propagating).
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            BackendErrorCode::Unavailable
                | BackendErrorCode::PermissionDenied
                | BackendErrorCode::FailedPrecondition
        )
    }

    /// Suffix pointing at the usual cause of rule and index failures, or an
    /// empty string for every other code.
    pub fn diagnostic_hint(&self) -> &'static str {
        match self.code {
            BackendErrorCode::PermissionDenied => "; check the document store security rules",
            BackendErrorCode::FailedPrecondition => "; the query probably needs a composite index",
            _ => "",
        }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

pub fn invalid_argument(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::PermissionDenied, message)
}

pub fn failed_precondition(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::FailedPrecondition, message)
}

pub fn unauthenticated(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::Unavailable, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let error = permission_denied("Missing or insufficient permissions");
        assert_eq!(
            error.to_string(),
            "Missing or insufficient permissions (backend/permission-denied)"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(unavailable("offline").is_transient());
        assert!(failed_precondition("index").is_transient());
        assert!(!not_found("users/u1").is_transient());
        assert!(!invalid_argument("bad filter").is_transient());
    }
}
