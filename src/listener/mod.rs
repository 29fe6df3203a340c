//! Bookkeeping for live real-time subscriptions.
//!
//! At most one listener is live per `(resource kind, filter key)` pair, so a
//! screen or service that asks twice for the same feed shares the first
//! subscription instead of leaking a second one.

mod registry;
mod types;

pub use registry::{ListenerHandle, ListenerRegistry};
pub use types::{ResourceKind, SubscriptionKey};
