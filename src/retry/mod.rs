mod coordinator;

pub use coordinator::{InitializationState, RetryCoordinator, RetryEvent, RetryFuture, RetryStatus};
