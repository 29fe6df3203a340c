//! Session lifecycle: startup sequencing, identity tracking and teardown.

mod directory;
mod manager;
mod state;

pub use directory::{UserDirectory, DEFAULT_ROLE, USERS_COLLECTION};
pub use manager::SessionManager;
pub use state::{AuthIdentity, DetailedStatus, SessionState};
