//! Execution tracker: the ledger every other component consults.
//!
//! Records the lifecycle and timing of every attempt. Recording is purely
//! observational and best-effort. A store hiccup while writing the ledger
//! is logged and counted, never propagated into the job's own control flow.
//! Persistent recording failures flip a degraded flag that surfaces as an
//! operational signal distinct from job failures.
//!
//! Per-attempt queue time (`started_at - queued_at`) and execution time
//! (`completed_at - started_at`) are retained as samples for windowed
//! aggregation: counts, success rate, and p50/p95/p99 durations.

#[cfg(feature = "otel-metrics")]
mod otel;

#[cfg(feature = "otel-metrics")]
pub use otel::MetricsCollector;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, RelayResult};
use crate::jobs::{AttemptStatus, JobId, JobRecord, JobStatusReport};
use crate::store::{CasOutcome, PutIfAbsent, SharedStore};

/// Consecutive recording failures before the tracker reports itself
/// degraded.
const DEGRADED_THRESHOLD: u32 = 5;

/// Samples retained per job type. Older samples fall outside any useful
/// stats window long before the cap bites.
const MAX_SAMPLES: u64 = 10_000;

/// One finished attempt's timing sample, retained for aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DurationSample {
    completed_at: DateTime<Utc>,
    queue_ms: u64,
    execution_ms: u64,
    success: bool,
}

/// Windowed aggregate over one job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStats {
    /// Job type aggregated.
    pub job_type: String,
    /// Attempts settled inside the window.
    pub count: u64,
    /// Of those, how many succeeded.
    pub success_count: u64,
    /// `success_count / count`, 0.0 when empty.
    pub success_rate: f64,
    /// Median execution time.
    pub p50_execution_ms: u64,
    /// 95th percentile execution time.
    pub p95_execution_ms: u64,
    /// 99th percentile execution time.
    pub p99_execution_ms: u64,
    /// Mean execution time.
    pub avg_execution_ms: u64,
    /// Mean time spent queued before a worker picked the attempt up.
    pub avg_queue_ms: u64,
}

impl JobStats {
    fn empty(job_type: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            count: 0,
            success_count: 0,
            success_rate: 0.0,
            p50_execution_ms: 0,
            p95_execution_ms: 0,
            p99_execution_ms: 0,
            avg_execution_ms: 0,
            avg_queue_ms: 0,
        }
    }
}

/// Best-effort attempt ledger over the shared store.
pub struct ExecutionTracker {
    store: Arc<dyn SharedStore>,
    recording_failures: AtomicU32,
    #[cfg(feature = "otel-metrics")]
    collector: parking_lot::RwLock<Option<Arc<MetricsCollector>>>,
}

impl ExecutionTracker {
    /// Create a tracker over the shared backend.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            recording_failures: AtomicU32::new(0),
            #[cfg(feature = "otel-metrics")]
            collector: parking_lot::RwLock::new(None),
        }
    }

    /// Attach an OpenTelemetry collector; settled attempts are exported
    /// alongside the store-backed samples.
    #[cfg(feature = "otel-metrics")]
    pub fn set_collector(&self, collector: Arc<MetricsCollector>) {
        *self.collector.write() = Some(collector);
    }

    fn record_key(job_id: JobId) -> String {
        format!("job:{job_id}")
    }

    fn samples_key(job_type: &str) -> String {
        format!("tracker:samples:{job_type}")
    }

    /// Whether recording has been failing persistently.
    ///
    /// This is the operational signal for "the ledger is blind", which is a
    /// different problem than any individual job failing.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.recording_failures.load(Ordering::Relaxed) >= DEGRADED_THRESHOLD
    }

    fn note_recording_result(&self, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.recording_failures.store(0, Ordering::Relaxed);
            }
            Err(detail) => {
                let failures = self.recording_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == DEGRADED_THRESHOLD {
                    error!(
                        consecutive_failures = failures,
                        "Execution tracker degraded: attempt ledger is not being recorded"
                    );
                } else {
                    warn!(error = %detail, "Failed to record attempt transition");
                }
            }
        }
    }

    /// Record a freshly submitted job (attempt 1 queued). Best-effort.
    pub async fn record_submitted(&self, record: &JobRecord) {
        let result = async {
            let json = serde_json::to_string(record).map_err(|e| e.to_string())?;
            match self
                .store
                .put_if_absent(&Self::record_key(record.job_id), &json, None)
                .await
                .map_err(|e| e.to_string())?
            {
                PutIfAbsent::Inserted => Ok(()),
                PutIfAbsent::Occupied(_) => {
                    Err(format!("job {} already recorded", record.job_id))
                }
            }
        }
        .await;
        self.note_recording_result(result);
    }

    /// Record that a retry attempt was opened and queued. Best-effort.
    pub async fn record_attempt_queued(&self, job_id: JobId, attempt_number: u32) {
        self.mutate(job_id, |record| {
            let opened = record.begin_attempt().map_err(|e| e.to_string())?;
            if opened != attempt_number {
                warn!(
                    job_id = %job_id,
                    ledger_attempt = opened,
                    envelope_attempt = attempt_number,
                    "Attempt ledger out of step with envelope"
                );
            }
            Ok(())
        })
        .await;
    }

    /// Record that a worker started executing an attempt. Best-effort.
    pub async fn record_started(&self, job_id: JobId, attempt_number: u32, worker_id: &str) {
        let worker_id = worker_id.to_string();
        self.mutate(job_id, move |record| {
            record
                .mark_started(attempt_number, &worker_id)
                .map_err(|e| e.to_string())
        })
        .await;
    }

    /// Record an attempt outcome and retain its timing sample. Best-effort.
    pub async fn record_completed(
        &self,
        job_id: JobId,
        attempt_number: u32,
        status: AttemptStatus,
        outcome_error: Option<(ErrorKind, String)>,
        result_ref: Option<String>,
    ) {
        let updated = self
            .mutate(job_id, move |record| {
                record
                    .mark_completed(
                        attempt_number,
                        status,
                        outcome_error.clone(),
                        result_ref.clone(),
                    )
                    .map_err(|e| e.to_string())
            })
            .await;

        let Some(record) = updated else { return };
        let Some(attempt) = record
            .attempts
            .iter()
            .find(|a| a.attempt_number == attempt_number)
        else {
            return;
        };
        let (Some(queue_ms), Some(execution_ms)) =
            (attempt.queue_time_ms(), attempt.execution_time_ms())
        else {
            // Attempt settled without ever starting (cancelled while
            // queued); nothing to sample.
            return;
        };

        let sample = DurationSample {
            completed_at: attempt.completed_at.unwrap_or_else(Utc::now),
            queue_ms,
            execution_ms,
            success: status == AttemptStatus::Succeeded,
        };
        #[cfg(feature = "otel-metrics")]
        if let Some(collector) = self.collector.read().as_ref() {
            collector.record_attempt(&record.job_type, queue_ms, execution_ms, sample.success);
        }
        let result = async {
            let json = serde_json::to_string(&sample).map_err(|e| e.to_string())?;
            let samples_key = Self::samples_key(&record.job_type);
            let len = self
                .store
                .append(&samples_key, &json)
                .await
                .map_err(|e| e.to_string())?;
            if len > MAX_SAMPLES {
                self.store
                    .list_trim(&samples_key, MAX_SAMPLES)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }
        .await;
        self.note_recording_result(result);

        debug!(
            job_id = %job_id,
            job_type = %record.job_type,
            attempt = attempt_number,
            status = status.name(),
            queue_ms = queue_ms,
            execution_ms = execution_ms,
            "Attempt settled"
        );
    }

    /// Mark a lineage cancelled, settling any open attempt. Best-effort.
    pub async fn record_cancelled(&self, job_id: JobId) {
        self.mutate(job_id, |record| {
            record.cancelled = true;
            if let Some(open) = record
                .attempts
                .iter()
                .find(|a| !a.status.is_settled())
                .map(|a| a.attempt_number)
            {
                record
                    .mark_completed(open, AttemptStatus::Cancelled, None, None)
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .await;
    }

    /// Fetch a job's full attempt ledger.
    ///
    /// # Errors
    ///
    /// Returns a store error if the ledger is unreachable.
    pub async fn record(&self, job_id: JobId) -> RelayResult<Option<JobRecord>> {
        match self.store.get(&Self::record_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw.data)?)),
            None => Ok(None),
        }
    }

    /// Fetch the client-facing status of a job.
    ///
    /// # Errors
    ///
    /// Returns a store error if the ledger is unreachable.
    pub async fn status(&self, job_id: JobId) -> RelayResult<Option<JobStatusReport>> {
        Ok(self
            .record(job_id)
            .await?
            .map(|record| JobStatusReport::from_record(&record)))
    }

    /// Aggregate samples for `job_type` over the trailing `window`.
    ///
    /// # Errors
    ///
    /// Returns a store error if samples are unreachable.
    pub async fn stats(&self, job_type: &str, window: Duration) -> RelayResult<JobStats> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let raw = self.store.list_range(&Self::samples_key(job_type)).await?;

        let mut execution = Vec::new();
        let mut queue_total: u128 = 0;
        let mut successes = 0_u64;
        for line in raw {
            let Ok(sample) = serde_json::from_str::<DurationSample>(&line) else {
                warn!(job_type = job_type, "Skipping corrupt duration sample");
                continue;
            };
            if sample.completed_at < cutoff {
                continue;
            }
            queue_total += u128::from(sample.queue_ms);
            if sample.success {
                successes += 1;
            }
            execution.push(sample.execution_ms);
        }

        if execution.is_empty() {
            return Ok(JobStats::empty(job_type));
        }

        execution.sort_unstable();
        let count = u64::try_from(execution.len()).unwrap_or(u64::MAX);
        let total: u128 = execution.iter().map(|&ms| u128::from(ms)).sum();

        #[allow(clippy::cast_precision_loss)]
        let success_rate = successes as f64 / count as f64;

        Ok(JobStats {
            job_type: job_type.to_string(),
            count,
            success_count: successes,
            success_rate,
            p50_execution_ms: percentile(&execution, 50),
            p95_execution_ms: percentile(&execution, 95),
            p99_execution_ms: percentile(&execution, 99),
            avg_execution_ms: u64::try_from(total / u128::from(count)).unwrap_or(u64::MAX),
            avg_queue_ms: u64::try_from(queue_total / u128::from(count)).unwrap_or(u64::MAX),
        })
    }

    /// Render stats for the given job types in a pull-based text exposition
    /// format, one metric per line, for external scrapers.
    ///
    /// # Errors
    ///
    /// Returns a store error if samples are unreachable.
    pub async fn render_metrics(
        &self,
        job_types: &[&str],
        window: Duration,
    ) -> RelayResult<String> {
        use std::fmt::Write;

        let mut out = String::new();
        for job_type in job_types {
            let stats = self.stats(job_type, window).await?;
            let labels = format!("{{job_type=\"{job_type}\"}}");
            let _ = writeln!(out, "relay_jobs_attempts_total{labels} {}", stats.count);
            let _ = writeln!(
                out,
                "relay_jobs_attempts_succeeded_total{labels} {}",
                stats.success_count
            );
            let _ = writeln!(
                out,
                "relay_jobs_execution_ms{{job_type=\"{job_type}\",quantile=\"0.5\"}} {}",
                stats.p50_execution_ms
            );
            let _ = writeln!(
                out,
                "relay_jobs_execution_ms{{job_type=\"{job_type}\",quantile=\"0.95\"}} {}",
                stats.p95_execution_ms
            );
            let _ = writeln!(
                out,
                "relay_jobs_execution_ms{{job_type=\"{job_type}\",quantile=\"0.99\"}} {}",
                stats.p99_execution_ms
            );
            let _ = writeln!(
                out,
                "relay_jobs_queue_ms_avg{labels} {}",
                stats.avg_queue_ms
            );
        }
        let _ = writeln!(
            out,
            "relay_jobs_tracker_degraded {}",
            u8::from(self.is_degraded())
        );
        Ok(out)
    }

    /// Read-modify-CAS a job record, returning the updated record on
    /// success. All failures are absorbed into the degraded counter.
    async fn mutate<F>(&self, job_id: JobId, mut apply: F) -> Option<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<(), String>,
    {
        let key = Self::record_key(job_id);
        let result: Result<JobRecord, String> = async {
            loop {
                let raw = self
                    .store
                    .get(&key)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("no ledger for job {job_id}"))?;
                let mut record: JobRecord =
                    serde_json::from_str(&raw.data).map_err(|e| e.to_string())?;
                apply(&mut record)?;
                let json = serde_json::to_string(&record).map_err(|e| e.to_string())?;
                match self
                    .store
                    .compare_and_swap(&key, Some(raw.version), &json)
                    .await
                    .map_err(|e| e.to_string())?
                {
                    CasOutcome::Swapped(_) => return Ok(record),
                    CasOutcome::Conflict => {}
                }
            }
        }
        .await;

        match result {
            Ok(record) => {
                self.note_recording_result(Ok(()));
                Some(record)
            }
            Err(detail) => {
                self.note_recording_result(Err(detail));
                None
            }
        }
    }
}

fn percentile(sorted: &[u64], pct: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (u64::try_from(sorted.len()).unwrap_or(u64::MAX) * u64::from(pct)).div_ceil(100);
    let index = usize::try_from(rank.saturating_sub(1)).unwrap_or(0);
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn tracker() -> ExecutionTracker {
        ExecutionTracker::new(Arc::new(MemoryStore::new()))
    }

    async fn run_one(tracker: &ExecutionTracker, job_type: &str, success: bool) -> JobId {
        let record = JobRecord::new(JobId::new(), job_type, "default", None);
        let job_id = record.job_id;
        tracker.record_submitted(&record).await;
        tracker.record_started(job_id, 1, "worker-0").await;
        let (status, error) = if success {
            (AttemptStatus::Succeeded, None)
        } else {
            (
                AttemptStatus::FailedRetryable,
                Some((ErrorKind::Retryable, "boom".to_string())),
            )
        };
        tracker
            .record_completed(job_id, 1, status, error, None)
            .await;
        job_id
    }

    #[test]
    fn test_percentile_selection() {
        let sorted = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile(&sorted, 50), 50);
        assert_eq!(percentile(&sorted, 95), 100);
        assert_eq!(percentile(&sorted, 99), 100);
        assert_eq!(percentile(&[42], 50), 42);
        assert_eq!(percentile(&[], 50), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_recorded_and_queryable() {
        let tracker = tracker();
        let job_id = run_one(&tracker, "train-model", true).await;

        let record = tracker.record(job_id).await.unwrap().unwrap();
        assert_eq!(record.attempt_count(), 1);
        assert_eq!(
            record.last_attempt().unwrap().status,
            AttemptStatus::Succeeded
        );

        let report = tracker.status(job_id).await.unwrap().unwrap();
        assert_eq!(report.attempt_count, 1);
        assert!(report.status.is_terminal());
    }

    #[tokio::test]
    async fn test_stats_aggregate_successes_and_failures() {
        let tracker = tracker();
        for _ in 0..3 {
            run_one(&tracker, "export-report", true).await;
        }
        run_one(&tracker, "export-report", false).await;

        let stats = tracker
            .stats("export-report", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.success_count, 3);
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stats_window_excludes_nothing_recent() {
        let tracker = tracker();
        run_one(&tracker, "x", true).await;
        // A tiny window in the future direction still includes just-finished
        // samples.
        let stats = tracker.stats("x", Duration::from_secs(10)).await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_type_has_empty_stats() {
        let tracker = tracker();
        let stats = tracker
            .stats("never-ran", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stats.count, 0);
        assert!((stats.success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_recording_failure_does_not_propagate() {
        let tracker = tracker();
        // No ledger exists for this job; recording silently degrades.
        tracker.record_started(JobId::new(), 1, "worker-0").await;
        assert!(!tracker.is_degraded());
    }

    #[tokio::test]
    async fn test_degraded_after_persistent_failures() {
        let tracker = tracker();
        for _ in 0..DEGRADED_THRESHOLD {
            tracker.record_started(JobId::new(), 1, "worker-0").await;
        }
        assert!(tracker.is_degraded());
        // A successful recording clears the signal.
        run_one(&tracker, "recovers", true).await;
        assert!(!tracker.is_degraded());
    }

    #[tokio::test]
    async fn test_cancelled_lineage_settles_open_attempt() {
        let tracker = tracker();
        let record = JobRecord::new(JobId::new(), "slow", "default", None);
        let job_id = record.job_id;
        tracker.record_submitted(&record).await;
        tracker.record_cancelled(job_id).await;

        let record = tracker.record(job_id).await.unwrap().unwrap();
        assert!(record.cancelled);
        assert_eq!(
            record.last_attempt().unwrap().status,
            AttemptStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_samples_are_capped_per_job_type() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let tracker = ExecutionTracker::new(Arc::clone(&store));
        let key = ExecutionTracker::samples_key("noisy");
        let stale = serde_json::to_string(&DurationSample {
            completed_at: Utc::now(),
            queue_ms: 1,
            execution_ms: 1,
            success: false,
        })
        .unwrap();
        for _ in 0..MAX_SAMPLES + 5 {
            store.append(&key, &stale).await.unwrap();
        }

        run_one(&tracker, "noisy", true).await;

        let retained = store.list_range(&key).await.unwrap();
        assert_eq!(u64::try_from(retained.len()).unwrap(), MAX_SAMPLES);
        // The trim drops from the old end; the fresh sample survives.
        let newest: DurationSample =
            serde_json::from_str(retained.last().unwrap()).unwrap();
        assert!(newest.success);
    }

    #[tokio::test]
    async fn test_render_metrics_exposition() {
        let tracker = tracker();
        run_one(&tracker, "train-model", true).await;
        let text = tracker
            .render_metrics(&["train-model"], Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(text.contains("relay_jobs_attempts_total{job_type=\"train-model\"} 1"));
        assert!(text.contains("quantile=\"0.95\""));
        assert!(text.contains("relay_jobs_tracker_degraded 0"));
    }
}
