pub mod backoff;
pub mod subscribe;

pub use backoff::{calculate_backoff, BackoffConfig};
pub use subscribe::{ObserverList, PartialObserver, Unsubscribe};
