//! Shared state and messaging for batch jobs
//!
//! Thread-safe progress records and event types used between the batch worker
//! thread and its pollers / subscribers.

pub mod jobs;
pub mod messages;
pub mod state;

pub use jobs::BatchJob;
pub use messages::JobEvent;
pub use state::{FileOutcome, JobCounts, JobProgress, JobStatus};
