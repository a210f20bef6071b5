//! Job-level status as reported to polling clients.

use serde::{Deserialize, Serialize};

use super::attempt::{AttemptStatus, JobRecord};
use super::JobId;

/// Aggregated status of a job across all of its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first execution.
    Queued,
    /// An attempt is currently executing.
    Running,
    /// A previous attempt failed; another attempt is scheduled or queued.
    Retrying,
    /// The job completed successfully.
    Succeeded,
    /// The job exhausted retries or failed permanently; see the dead-letter
    /// store for details.
    Failed,
    /// The lineage was cancelled.
    Cancelled,
}

impl JobStatus {
    /// Whether the job will make no further progress.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Human-readable status name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Status snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    /// The job queried.
    pub job_id: JobId,
    /// Aggregated status.
    pub status: JobStatus,
    /// Attempts recorded so far.
    pub attempt_count: u32,
    /// Most recent failure description, if any.
    pub last_error: Option<String>,
}

impl JobStatusReport {
    /// Derive the client-facing report from a job's attempt ledger.
    #[must_use]
    pub fn from_record(record: &JobRecord) -> Self {
        let status = if record.cancelled {
            JobStatus::Cancelled
        } else {
            match record.last_attempt().map(|a| a.status) {
                Some(AttemptStatus::Succeeded) => JobStatus::Succeeded,
                Some(AttemptStatus::FailedTerminal) => JobStatus::Failed,
                Some(AttemptStatus::Cancelled) => JobStatus::Cancelled,
                Some(AttemptStatus::Running) => JobStatus::Running,
                Some(AttemptStatus::Queued | AttemptStatus::FailedRetryable) | None => {
                    if record.attempt_count() > 1
                        || record
                            .last_attempt()
                            .is_some_and(|a| a.status == AttemptStatus::FailedRetryable)
                    {
                        JobStatus::Retrying
                    } else {
                        JobStatus::Queued
                    }
                }
            }
        };
        Self {
            job_id: record.job_id,
            status,
            attempt_count: record.attempt_count(),
            last_error: record.last_error().map(str::to_string),
        }
    }
}
