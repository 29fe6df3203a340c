use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::backend::BackendError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionErrorCode {
    Backend,
    RetryExhausted,
    InvalidPayload,
    InvalidConfig,
    NotSignedIn,
    UnknownJob,
    ShutDown,
}

impl SessionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionErrorCode::Backend => "session/backend",
            SessionErrorCode::RetryExhausted => "session/retry-exhausted",
            SessionErrorCode::InvalidPayload => "session/invalid-payload",
            SessionErrorCode::InvalidConfig => "session/invalid-config",
            SessionErrorCode::NotSignedIn => "session/not-signed-in",
            SessionErrorCode::UnknownJob => "session/unknown-job",
            SessionErrorCode::ShutDown => "session/shut-down",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionError {
    pub code: SessionErrorCode,
    message: String,
    source: Option<BackendError>,
}

impl SessionError {
    pub fn new(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The collaborator error this failure was raised from, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        self.source.as_ref()
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|err| err as &(dyn Error + 'static))
    }
}

impl From<BackendError> for SessionError {
    fn from(error: BackendError) -> Self {
        Self {
            code: SessionErrorCode::Backend,
            message: error.message().to_string(),
            source: Some(error),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

pub fn retry_exhausted(message: impl Into<String>) -> SessionError {
    SessionError::new(SessionErrorCode::RetryExhausted, message)
}

pub fn invalid_payload(message: impl Into<String>) -> SessionError {
    SessionError::new(SessionErrorCode::InvalidPayload, message)
}

pub fn invalid_config(message: impl Into<String>) -> SessionError {
    SessionError::new(SessionErrorCode::InvalidConfig, message)
}

pub fn not_signed_in() -> SessionError {
    SessionError::new(
        SessionErrorCode::NotSignedIn,
        "No identity is signed in with the identity provider",
    )
}

pub fn unknown_job(name: &str) -> SessionError {
    SessionError::new(
        SessionErrorCode::UnknownJob,
        format!("No janitor job named '{name}' is scheduled"),
    )
}

pub fn shut_down(message: impl Into<String>) -> SessionError {
    SessionError::new(SessionErrorCode::ShutDown, message)
}
