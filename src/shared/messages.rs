//! Events pushed to batch job subscribers

use std::path::PathBuf;

use crate::shared::state::{JobCounts, JobProgress};

/// Progress notifications sent by the batch worker
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Worker started processing
    Started { job_id: String, total: usize },
    /// One file was processed
    FileFinished {
        index: usize,
        path: PathBuf,
        success: bool,
        error: Option<String>,
        counts: JobCounts,
    },
    /// All files processed; final snapshot
    Finished(Box<JobProgress>),
}
