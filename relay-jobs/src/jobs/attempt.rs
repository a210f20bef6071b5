//! Per-job attempt ledger.
//!
//! [`JobRecord`] is the single document the execution tracker persists per
//! job id. Attempt numbers increase monotonically and at most one attempt is
//! running at a time; the mutation methods enforce both so every writer goes
//! through the same state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;
use crate::error::ErrorKind;

/// Per-attempt lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is executing it.
    Running,
    /// Finished successfully; terminal for the whole job.
    Succeeded,
    /// Failed with a retryable or throttled error; a later attempt may follow.
    FailedRetryable,
    /// Failed permanently; the job is headed for the dead-letter store.
    FailedTerminal,
    /// Cancelled between attempts.
    Cancelled,
}

impl AttemptStatus {
    /// Whether this status ends the attempt (no further transitions).
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Human-readable status name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One execution try of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    /// 1-based attempt number, monotonically increasing per job.
    pub attempt_number: u32,
    /// Current lifecycle state.
    pub status: AttemptStatus,
    /// When the attempt was enqueued.
    pub queued_at: DateTime<Utc>,
    /// When a worker picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a settled state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker that executed it.
    pub worker_id: Option<String>,
    /// Failure classification, if it failed.
    pub error_kind: Option<ErrorKind>,
    /// Failure description, if it failed.
    pub error_detail: Option<String>,
    /// Opaque handle to the job body's output, owned by the body.
    pub result_ref: Option<String>,
}

impl JobAttempt {
    fn queued(attempt_number: u32, queued_at: DateTime<Utc>) -> Self {
        Self {
            attempt_number,
            status: AttemptStatus::Queued,
            queued_at,
            started_at: None,
            completed_at: None,
            worker_id: None,
            error_kind: None,
            error_detail: None,
            result_ref: None,
        }
    }

    /// Time spent waiting in the queue, if the attempt has started.
    #[must_use]
    pub fn queue_time_ms(&self) -> Option<u64> {
        self.started_at.map(|started| {
            started
                .signed_duration_since(self.queued_at)
                .num_milliseconds()
                .max(0)
                .unsigned_abs()
        })
    }

    /// Time spent executing, if the attempt has settled.
    #[must_use]
    pub fn execution_time_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(
                completed
                    .signed_duration_since(started)
                    .num_milliseconds()
                    .max(0)
                    .unsigned_abs(),
            ),
            _ => None,
        }
    }
}

/// Attempt-ledger violation. Indicates a dispatcher bug, not bad input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttemptError {
    /// A new attempt was opened while another is still queued or running.
    #[error("attempt {open} of job {job_id} is still open")]
    AttemptStillOpen {
        /// Job being mutated.
        job_id: JobId,
        /// The attempt that has not settled yet.
        open: u32,
    },

    /// A transition was applied to an attempt in the wrong state.
    #[error("attempt {attempt} of job {job_id} is {actual}, expected {expected}")]
    WrongState {
        /// Job being mutated.
        job_id: JobId,
        /// Attempt number.
        attempt: u32,
        /// State the attempt is actually in.
        actual: &'static str,
        /// State the transition requires.
        expected: &'static str,
    },

    /// The record has no attempts yet.
    #[error("job {job_id} has no attempts")]
    NoAttempts {
        /// Job being mutated.
        job_id: JobId,
    },
}

/// Full attempt history of one job, the tracker's unit of persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable job identity.
    pub job_id: JobId,
    /// Logical operation name supplied at submission.
    pub job_type: String,
    /// Queue the job was submitted to.
    pub queue: String,
    /// Dedup key, if the submitter supplied one.
    pub dedup_key: Option<String>,
    /// Set when the lineage is cancelled between attempts.
    pub cancelled: bool,
    /// All attempts, oldest first.
    pub attempts: Vec<JobAttempt>,
}

impl JobRecord {
    /// Create a record with its first attempt queued.
    #[must_use]
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        dedup_key: Option<String>,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            queue: queue.into(),
            dedup_key,
            cancelled: false,
            attempts: vec![JobAttempt::queued(1, Utc::now())],
        }
    }

    /// Number of attempts recorded so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// The most recent attempt.
    #[must_use]
    pub fn last_attempt(&self) -> Option<&JobAttempt> {
        self.attempts.last()
    }

    /// Most recent failure description, if any attempt failed.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error_detail.as_deref())
    }

    /// Open the next attempt. Fails if the previous attempt has not settled.
    ///
    /// # Errors
    ///
    /// Returns [`AttemptError::AttemptStillOpen`] if an attempt is queued or
    /// running.
    pub fn begin_attempt(&mut self) -> Result<u32, AttemptError> {
        if let Some(last) = self.attempts.last() {
            if !last.status.is_settled() {
                return Err(AttemptError::AttemptStillOpen {
                    job_id: self.job_id,
                    open: last.attempt_number,
                });
            }
        }
        let next = self.attempt_count() + 1;
        self.attempts.push(JobAttempt::queued(next, Utc::now()));
        Ok(next)
    }

    /// Mark the given attempt as running on `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt is missing or not queued.
    pub fn mark_started(
        &mut self,
        attempt_number: u32,
        worker_id: &str,
    ) -> Result<(), AttemptError> {
        let job_id = self.job_id;
        let attempt = self.attempt_mut(attempt_number)?;
        if attempt.status != AttemptStatus::Queued {
            return Err(AttemptError::WrongState {
                job_id,
                attempt: attempt_number,
                actual: attempt.status.name(),
                expected: "queued",
            });
        }
        attempt.status = AttemptStatus::Running;
        attempt.started_at = Some(Utc::now());
        attempt.worker_id = Some(worker_id.to_string());
        Ok(())
    }

    /// Settle the given attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt is missing or already settled.
    pub fn mark_completed(
        &mut self,
        attempt_number: u32,
        status: AttemptStatus,
        error: Option<(ErrorKind, String)>,
        result_ref: Option<String>,
    ) -> Result<(), AttemptError> {
        let job_id = self.job_id;
        let attempt = self.attempt_mut(attempt_number)?;
        if attempt.status.is_settled() {
            return Err(AttemptError::WrongState {
                job_id,
                attempt: attempt_number,
                actual: attempt.status.name(),
                expected: "queued or running",
            });
        }
        attempt.status = status;
        attempt.completed_at = Some(Utc::now());
        if let Some((kind, detail)) = error {
            attempt.error_kind = Some(kind);
            attempt.error_detail = Some(detail);
        }
        attempt.result_ref = result_ref;
        Ok(())
    }

    fn attempt_mut(
        &mut self,
        attempt_number: u32,
    ) -> Result<&mut JobAttempt, AttemptError> {
        let job_id = self.job_id;
        self.attempts
            .iter_mut()
            .find(|a| a.attempt_number == attempt_number)
            .ok_or(AttemptError::NoAttempts { job_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(JobId::new(), "train-model", "default", None)
    }

    #[test]
    fn test_new_record_has_first_attempt_queued() {
        let record = record();
        assert_eq!(record.attempt_count(), 1);
        assert_eq!(record.last_attempt().unwrap().status, AttemptStatus::Queued);
    }

    #[test]
    fn test_attempt_numbers_are_monotonic() {
        let mut record = record();
        record.mark_started(1, "worker-0").unwrap();
        record
            .mark_completed(
                1,
                AttemptStatus::FailedRetryable,
                Some((ErrorKind::Retryable, "timeout".to_string())),
                None,
            )
            .unwrap();
        let next = record.begin_attempt().unwrap();
        assert_eq!(next, 2);
        assert_eq!(record.attempt_count(), 2);
    }

    #[test]
    fn test_begin_attempt_rejects_open_attempt() {
        let mut record = record();
        let err = record.begin_attempt().unwrap_err();
        assert!(matches!(err, AttemptError::AttemptStillOpen { open: 1, .. }));

        record.mark_started(1, "worker-0").unwrap();
        let err = record.begin_attempt().unwrap_err();
        assert!(matches!(err, AttemptError::AttemptStillOpen { open: 1, .. }));
    }

    #[test]
    fn test_mark_started_requires_queued() {
        let mut record = record();
        record.mark_started(1, "worker-0").unwrap();
        let err = record.mark_started(1, "worker-1").unwrap_err();
        assert!(matches!(err, AttemptError::WrongState { .. }));
    }

    #[test]
    fn test_mark_completed_is_final_per_attempt() {
        let mut record = record();
        record.mark_started(1, "worker-0").unwrap();
        record
            .mark_completed(1, AttemptStatus::Succeeded, None, None)
            .unwrap();
        let err = record
            .mark_completed(1, AttemptStatus::FailedTerminal, None, None)
            .unwrap_err();
        assert!(matches!(err, AttemptError::WrongState { .. }));
    }

    #[test]
    fn test_last_error_finds_most_recent_failure() {
        let mut record = record();
        record.mark_started(1, "worker-0").unwrap();
        record
            .mark_completed(
                1,
                AttemptStatus::FailedRetryable,
                Some((ErrorKind::Retryable, "first".to_string())),
                None,
            )
            .unwrap();
        record.begin_attempt().unwrap();
        record.mark_started(2, "worker-1").unwrap();
        record
            .mark_completed(
                2,
                AttemptStatus::FailedRetryable,
                Some((ErrorKind::Retryable, "second".to_string())),
                None,
            )
            .unwrap();
        assert_eq!(record.last_error(), Some("second"));
    }

    #[test]
    fn test_queue_and_execution_times_are_non_negative() {
        let mut record = record();
        record.mark_started(1, "worker-0").unwrap();
        record
            .mark_completed(1, AttemptStatus::Succeeded, None, None)
            .unwrap();
        let attempt = record.last_attempt().unwrap();
        assert!(attempt.queue_time_ms().is_some());
        assert!(attempt.execution_time_ms().is_some());
    }
}
