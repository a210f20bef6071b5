//! Dead-letter store for jobs that exhausted retries or failed permanently.
//!
//! Admission is append-only: entries are written to the shared store before
//! the submitter is acknowledged, so a crash between admit and ack can at
//! worst re-admit (at-least-once), never lose the failure. History is never
//! mutated; reprocessing starts a brand-new attempt lineage and only flips
//! the `reprocessed` marker on the original entry, preserving the audit
//! trail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::jobs::{JobAttempt, JobId, JobRecord};
use crate::store::{CasOutcome, SharedStore};

const INDEX_KEY: &str = "dlq:index";

/// Identity of one dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

impl DeadLetterId {
    /// Generate a fresh entry id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an entry id from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One dead-lettered job, immutable except for the `reprocessed*` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry identity.
    pub id: DeadLetterId,
    /// The failed job.
    pub job_id: JobId,
    /// Logical operation name.
    pub job_type: String,
    /// Queue the job ran on.
    pub queue: String,
    /// The submitted payload, kept so the job can be reprocessed.
    pub payload: serde_json::Value,
    /// Snapshot of the final attempt.
    pub final_attempt: JobAttempt,
    /// Classification of the final failure.
    pub error_kind: ErrorKind,
    /// Description of the final failure.
    pub error_detail: String,
    /// Attempts consumed before giving up.
    pub total_attempts: u32,
    /// When the job first failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the entry was admitted.
    pub admitted_at: DateTime<Utc>,
    /// Whether a new lineage was started from this entry.
    pub reprocessed: bool,
    /// When reprocessing happened.
    pub reprocessed_at: Option<DateTime<Utc>>,
    /// The job id of the new lineage.
    pub reprocessed_as: Option<JobId>,
}

impl DeadLetterEntry {
    /// Build an entry from a job's attempt ledger and its payload.
    ///
    /// # Panics
    ///
    /// Never panics; a ledger with no attempts produces a synthetic final
    /// attempt snapshot.
    #[must_use]
    pub fn from_failure(
        record: &JobRecord,
        payload: serde_json::Value,
        error_kind: ErrorKind,
        error_detail: String,
    ) -> Self {
        let final_attempt = record.last_attempt().cloned().unwrap_or(JobAttempt {
            attempt_number: 0,
            status: crate::jobs::AttemptStatus::FailedTerminal,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            error_kind: Some(error_kind),
            error_detail: Some(error_detail.clone()),
            result_ref: None,
        });
        let first_failed_at = record
            .attempts
            .iter()
            .find(|a| a.error_kind.is_some())
            .and_then(|a| a.completed_at)
            .unwrap_or_else(Utc::now);

        Self {
            id: DeadLetterId::new(),
            job_id: record.job_id,
            job_type: record.job_type.clone(),
            queue: record.queue.clone(),
            payload,
            final_attempt,
            error_kind,
            error_detail,
            total_attempts: record.attempt_count(),
            first_failed_at,
            admitted_at: Utc::now(),
            reprocessed: false,
            reprocessed_at: None,
            reprocessed_as: None,
        }
    }
}

/// Filter for listing entries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Only entries for this job type (exact match).
    pub job_type: Option<String>,
    /// Include entries already reprocessed.
    pub include_reprocessed: bool,
    /// Stop after this many entries.
    pub limit: Option<usize>,
}

/// Append-only dead-letter storage over the shared store.
pub struct DeadLetterStore {
    store: Arc<dyn SharedStore>,
}

impl DeadLetterStore {
    /// Create a store facade over the shared backend.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn key(id: DeadLetterId) -> String {
        format!("dlq:{id}")
    }

    /// Durably admit a failed job. Returns the new entry id.
    ///
    /// The entry document is written before the index, so a reader can never
    /// see an id it cannot resolve except during a crashed half-admit, which
    /// `list` tolerates.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails; the caller must treat that
    /// as "not admitted" and retry (at-least-once admission).
    pub async fn admit(&self, entry: &DeadLetterEntry) -> RelayResult<DeadLetterId> {
        let json = serde_json::to_string(entry)?;
        self.store.put(&Self::key(entry.id), &json, None).await?;
        self.store.append(INDEX_KEY, &entry.id.to_string()).await?;
        error!(
            job_id = %entry.job_id,
            job_type = %entry.job_type,
            dead_letter_id = %entry.id,
            total_attempts = entry.total_attempts,
            error_kind = %entry.error_kind,
            error = %entry.error_detail,
            "Job dead-lettered"
        );
        Ok(entry.id)
    }

    /// List entries matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the index is unreachable.
    pub async fn list(&self, filter: &DeadLetterFilter) -> RelayResult<Vec<DeadLetterEntry>> {
        let ids = self.store.list_range(INDEX_KEY).await?;
        let mut entries = Vec::new();
        for id in ids {
            let Some(raw) = self.store.get(&format!("dlq:{id}")).await? else {
                // Half-admitted or externally pruned; skip but leave a trace.
                warn!(dead_letter_id = %id, "Dead-letter index points at missing entry");
                continue;
            };
            let entry: DeadLetterEntry = serde_json::from_str(&raw.data)?;
            if let Some(job_type) = &filter.job_type {
                if &entry.job_type != job_type {
                    continue;
                }
            }
            if entry.reprocessed && !filter.include_reprocessed {
                continue;
            }
            entries.push(entry);
            if filter.limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }
        }
        Ok(entries)
    }

    /// Fetch one entry by id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the entry is unreachable.
    pub async fn get(&self, id: DeadLetterId) -> RelayResult<Option<DeadLetterEntry>> {
        match self.store.get(&Self::key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw.data)?)),
            None => Ok(None),
        }
    }

    /// Flip the `reprocessed` marker on an entry, recording the new lineage.
    ///
    /// History stays immutable otherwise. Concurrent reprocess calls resolve
    /// to one winner; the losers get [`RelayError::AlreadyReprocessed`].
    ///
    /// # Errors
    ///
    /// Fails if the entry is missing, already reprocessed, or the store is
    /// unreachable.
    pub async fn mark_reprocessed(
        &self,
        id: DeadLetterId,
        new_job_id: JobId,
    ) -> RelayResult<()> {
        let key = Self::key(id);
        loop {
            let Some(raw) = self.store.get(&key).await? else {
                return Err(RelayError::UnknownDeadLetter(id.to_string()));
            };
            let mut entry: DeadLetterEntry = serde_json::from_str(&raw.data)?;
            if entry.reprocessed {
                return Err(RelayError::AlreadyReprocessed(id.to_string()));
            }
            entry.reprocessed = true;
            entry.reprocessed_at = Some(Utc::now());
            entry.reprocessed_as = Some(new_job_id);
            let json = serde_json::to_string(&entry)?;
            match self
                .store
                .compare_and_swap(&key, Some(raw.version), &json)
                .await?
            {
                CasOutcome::Swapped(_) => return Ok(()),
                CasOutcome::Conflict => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn failed_record(job_type: &str) -> JobRecord {
        let mut record = JobRecord::new(JobId::new(), job_type, "default", None);
        record.mark_started(1, "worker-0").unwrap();
        record
            .mark_completed(
                1,
                crate::jobs::AttemptStatus::FailedTerminal,
                Some((ErrorKind::Retryable, "downstream gone".to_string())),
                None,
            )
            .unwrap();
        record
    }

    fn entry(job_type: &str) -> DeadLetterEntry {
        DeadLetterEntry::from_failure(
            &failed_record(job_type),
            serde_json::json!({"n": 1}),
            ErrorKind::Retryable,
            "downstream gone".to_string(),
        )
    }

    #[tokio::test]
    async fn test_admitted_entries_survive_a_new_facade() {
        let backend: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let store = DeadLetterStore::new(Arc::clone(&backend));
        for _ in 0..3 {
            store.admit(&entry("train-model")).await.unwrap();
        }

        // Simulates a process restart: a fresh facade over the same backend.
        let recovered = DeadLetterStore::new(backend);
        let entries = recovered
            .list(&DeadLetterFilter::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_list_filters_by_job_type_and_limit() {
        let store = DeadLetterStore::new(Arc::new(MemoryStore::new()));
        store.admit(&entry("train-model")).await.unwrap();
        store.admit(&entry("export-report")).await.unwrap();
        store.admit(&entry("train-model")).await.unwrap();

        let trains = store
            .list(&DeadLetterFilter {
                job_type: Some("train-model".to_string()),
                ..DeadLetterFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(trains.len(), 2);

        let limited = store
            .list(&DeadLetterFilter {
                limit: Some(1),
                ..DeadLetterFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_reprocessed_flips_marker_only() {
        let store = DeadLetterStore::new(Arc::new(MemoryStore::new()));
        let original = entry("train-model");
        let id = store.admit(&original).await.unwrap();

        let new_job = JobId::new();
        store.mark_reprocessed(id, new_job).await.unwrap();

        let after = store.get(id).await.unwrap().unwrap();
        assert!(after.reprocessed);
        assert_eq!(after.reprocessed_as, Some(new_job));
        // History is untouched.
        assert_eq!(after.job_id, original.job_id);
        assert_eq!(after.total_attempts, original.total_attempts);
        assert_eq!(after.error_detail, original.error_detail);
    }

    #[tokio::test]
    async fn test_double_reprocess_is_rejected() {
        let store = DeadLetterStore::new(Arc::new(MemoryStore::new()));
        let id = store.admit(&entry("train-model")).await.unwrap();
        store.mark_reprocessed(id, JobId::new()).await.unwrap();
        let err = store.mark_reprocessed(id, JobId::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyReprocessed(_)));
    }

    #[tokio::test]
    async fn test_reprocessed_entries_hidden_by_default() {
        let store = DeadLetterStore::new(Arc::new(MemoryStore::new()));
        let id = store.admit(&entry("train-model")).await.unwrap();
        store.mark_reprocessed(id, JobId::new()).await.unwrap();

        assert!(store
            .list(&DeadLetterFilter::default())
            .await
            .unwrap()
            .is_empty());
        let all = store
            .list(&DeadLetterFilter {
                include_reprocessed: true,
                ..DeadLetterFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_entry_errors() {
        let store = DeadLetterStore::new(Arc::new(MemoryStore::new()));
        let err = store
            .mark_reprocessed(DeadLetterId::new(), JobId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownDeadLetter(_)));
    }
}
