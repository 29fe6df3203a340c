use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::SessionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or stopped.
    Idle,
    Initializing,
    Ready,
    /// Initialization gave up after exhausting its retries. The application
    /// keeps running without the notification subsystem until
    /// [`SessionManager::reinitialize`](super::SessionManager::reinitialize).
    Degraded,
    /// No identity is signed in.
    SignedOut,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::SignedOut => "signed-out",
        }
    }

    /// Ready and degraded sessions both count as initialized so the UI is
    /// never held on a loading screen.
    pub fn is_initialized(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to the UI on every session transition.
#[derive(Clone, Debug)]
pub struct DetailedStatus {
    pub state: SessionState,
    pub is_initialized: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<SessionError>,
}

/// Last identity observed from the identity provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthIdentity {
    pub id: String,
    pub last_observed_at: DateTime<Utc>,
}

impl AuthIdentity {
    pub fn observed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_observed_at: Utc::now(),
        }
    }
}
