//! Narrow interfaces to the external collaborators the session layer talks to.
//!
//! The identity provider, document store and push provider are vendor
//! services; this crate only depends on the shapes below. `memory` provides
//! in-process implementations used by tests and local development.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::util::subscribe::Unsubscribe;

pub mod error;
pub mod memory;
mod types;

pub use error::{BackendError, BackendErrorCode, BackendResult};
pub use types::{
    BatchOp, Credentials, Direction, Document, Filter, FilterOp, IdTokenResult, Identity,
    IdentityCallback, MessageHandler, MessagePayload, NotificationPayload, OrderBy,
    PermissionState, Query, SignInResult, SnapshotCallback,
};

#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn sign_in(&self, credentials: &Credentials) -> BackendResult<SignInResult>;

    async fn sign_out(&self) -> BackendResult<()>;

    /// Registers `callback` for identity transitions. Implementations may fire
    /// redundant events for an unchanged identity.
    fn on_identity_change(&self, callback: IdentityCallback) -> Unsubscribe;

    fn current_identity(&self) -> Option<Identity>;

    /// Returns the current ID token; `force_refresh` bypasses the provider's
    /// token cache so that updated custom claims are picked up.
    async fn get_token(&self, force_refresh: bool) -> BackendResult<IdTokenResult>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Returns `Ok(None)` when the document does not exist.
    async fn read(&self, collection: &str, id: &str) -> BackendResult<Option<Document>>;

    async fn query(&self, query: &Query) -> BackendResult<Vec<Document>>;

    /// Merges `patch` into the document, creating it when absent.
    async fn write(&self, collection: &str, id: &str, patch: Map<String, Value>)
        -> BackendResult<()>;

    /// Starts a real-time subscription. Errors raised while establishing the
    /// listener are returned directly; later failures are delivered through
    /// `callback`.
    fn subscribe(&self, query: Query, callback: SnapshotCallback) -> BackendResult<Unsubscribe>;

    /// Applies every operation atomically.
    async fn commit(&self, ops: Vec<BatchOp>) -> BackendResult<()>;
}

#[async_trait]
pub trait MessagingProvider: Send + Sync + 'static {
    async fn request_permission(&self) -> BackendResult<PermissionState>;

    async fn get_token(&self) -> BackendResult<String>;

    fn on_foreground_message(&self, handler: MessageHandler) -> Unsubscribe;

    fn on_background_message(&self, handler: MessageHandler);
}

pub type IdentityProviderArc = Arc<dyn IdentityProvider>;
pub type DocumentStoreArc = Arc<dyn DocumentStore>;
pub type MessagingProviderArc = Arc<dyn MessagingProvider>;
