//! Batch job progress record

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::pipeline::RunOutput;

/// Lifecycle of a batch job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
}

/// Outcome of one file in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RunOutput>,
}

/// Aggregate counters, cheap to copy into events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Progress of a batch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub counts: JobCounts,
    /// File being processed right now
    pub current_file: Option<PathBuf>,
    pub outcomes: Vec<FileOutcome>,
    /// Unix seconds
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl JobProgress {
    pub fn new(job_id: &str, total: usize) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Pending,
            counts: JobCounts {
                total,
                ..Default::default()
            },
            current_file: None,
            outcomes: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(unix_now());
    }

    pub fn mark_finished(&mut self) {
        self.status = JobStatus::Completed;
        self.current_file = None;
        self.finished_at = Some(unix_now());
    }

    /// Record the outcome of one file
    pub fn record(&mut self, outcome: FileOutcome) {
        self.counts.processed += 1;
        if outcome.success {
            self.counts.succeeded += 1;
        } else {
            self.counts.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    /// Completion percentage (0 - 100)
    pub fn percent(&self) -> f32 {
        if self.counts.total == 0 {
            return 100.0;
        }
        self.counts.processed as f32 * 100.0 / self.counts.total as f32
    }

    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool) -> FileOutcome {
        FileOutcome {
            path: PathBuf::from("page.png"),
            success,
            error: (!success).then(|| "unreadable".to_string()),
            output: None,
        }
    }

    #[test]
    fn test_progress_counts() {
        let mut progress = JobProgress::new("job", 4);
        assert_eq!(progress.status, JobStatus::Pending);
        assert_eq!(progress.percent(), 0.0);

        progress.mark_started();
        progress.record(outcome(true));
        progress.record(outcome(false));

        assert_eq!(progress.counts.processed, 2);
        assert_eq!(progress.counts.succeeded, 1);
        assert_eq!(progress.counts.failed, 1);
        assert_eq!(progress.percent(), 50.0);
        assert!(!progress.is_finished());

        progress.mark_finished();
        assert!(progress.is_finished());
        assert!(progress.finished_at.is_some());
    }

    #[test]
    fn test_empty_job_is_complete_percent() {
        assert_eq!(JobProgress::new("job", 0).percent(), 100.0);
    }
}
