//! Point-in-time views of a downloader.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ledger::{FailureReason, RunStatus};

/// A failed URI and why it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTarget {
    pub uri: String,
    pub reason: FailureReason,
}

impl From<(String, FailureReason)> for FailedTarget {
    fn from((uri, reason): (String, FailureReason)) -> Self {
        Self { uri, reason }
    }
}

/// Progress of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSnapshot {
    pub uri: String,
    pub path: PathBuf,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub expected_size: Option<u64>,
}

/// Everything the downloader can report, captured at once.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    /// Completed share of the run's targets.
    pub progress: f64,
    /// Mean per-target progress, including partial chunked transfers.
    pub detailed_progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_per_second: f64,
    pub files_per_second: f64,
    pub max_concurrency: usize,
    pub abandon_on_failure: bool,
    pub continue_after_failure: bool,
    pub pending: Vec<String>,
    pub active: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<FailedTarget>,
    pub targets: Vec<TargetSnapshot>,
}

/// Result of waiting for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub completed: Vec<String>,
    pub failed: Vec<FailedTarget>,
    pub elapsed: Duration,
}

impl RunOutcome {
    /// Finished normally with no failed targets.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded && self.failed.is_empty()
    }
}
