//! Interval-driven sweeps that correct stale records in the document store.

mod job;
mod jobs;
mod scheduler;

pub use job::{JanitorJob, StalePredicate, SweepAction};
pub use jobs::{
    standard_jobs, ACCESS_LOGS, CHAT_MESSAGES, EXPIRED_HOLDS, READ_NOTIFICATIONS,
    RESOLVED_EMERGENCIES,
};
pub use scheduler::{Janitor, JobStats};
