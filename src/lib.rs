//! # gaterlink-session
//!
//! Client-side session and cache coordination for the GaterLink access-control
//! app. The crate sits between the application and three hosted services (an
//! identity provider, a real-time document store and a push provider) and
//! keeps the client's view of them consistent:
//!
//! - [`session::SessionManager`] sequences startup, retries it with backoff
//!   and reacts to sign-in and sign-out;
//! - [`listener::ListenerRegistry`] keeps at most one live subscription per
//!   resource and filter;
//! - [`janitor::Janitor`] runs periodic sweeps over stale records;
//! - [`cache::TtlCache`] backs short-lived profile lookups;
//! - [`notifications::NotificationCenter`] delivers typed notifications.
//!
//! The collaborators are reached only through the traits in [`backend`];
//! `backend::memory` ships in-process implementations.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gaterlink_session::backend::memory::{
//!     InMemoryDocumentStore, InMemoryIdentityProvider, InMemoryMessagingProvider,
//! };
//! use gaterlink_session::config::SessionConfig;
//! use gaterlink_session::session::SessionManager;
//!
//! # async fn run() {
//! let session = SessionManager::new(
//!     SessionConfig::default(),
//!     Arc::new(InMemoryIdentityProvider::new()),
//!     Arc::new(InMemoryDocumentStore::new()),
//!     Arc::new(InMemoryMessagingProvider::new()),
//! );
//! let status = session.start().await;
//! println!("session is {}", status.state);
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod janitor;
pub mod listener;
pub mod notifications;
pub mod platform;
pub mod retry;
pub mod session;
pub mod util;

pub use config::SessionConfig;
pub use error::{SessionError, SessionErrorCode, SessionResult};
pub use session::{DetailedStatus, SessionManager, SessionState};
