//! The dispatcher: submission, workers, and the full resilience pipeline.
//!
//! One attempt flows through the pipeline in a fixed order:
//!
//! 1. submission resolves the dedup key (winner starts a lineage, losers
//!    attach to the winner's job id);
//! 2. a worker dequeues the envelope and consults the admission policy
//!    (rate limit, then circuit); a deferral re-enqueues the same attempt
//!    with a `run_at` in the future and consumes no retry budget;
//! 3. the job body executes with a cancellation token;
//! 4. the outcome feeds the circuit, settles the attempt in the tracker,
//!    and either finishes the job, schedules a retry through the retry
//!    scheduler, or routes the job to the dead-letter store.
//!
//! Workers never sleep out a backoff delay; delays are `run_at` timestamps
//! handed to the queue collaborator.

mod queue;

pub use queue::{InMemoryQueue, JobEnvelope, JobQueue};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::circuit::CircuitBreaker;
use crate::config::{IdempotencyConfig, RelayConfig};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeadLetterStore};
use crate::error::{ErrorKind, JobError, RelayError, RelayResult};
use crate::idempotency::{AcquireOutcome, IdempotencyGuard};
use crate::jobs::{
    AttemptStatus, CancellationRegistry, CancellationToken, JobHandler, JobId, JobRecord,
    JobStatusReport,
};
use crate::policy::{Admission, AdmissionPolicy};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::SharedStore;
use crate::tracker::ExecutionTracker;

/// Queue name recorded for all submissions.
const DEFAULT_QUEUE: &str = "default";

/// Re-enqueue delay when an attempt could not be evaluated because the
/// shared store was unreachable.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new lineage was started.
    Accepted {
        /// The new job's id.
        job_id: JobId,
    },
    /// An identical submission is already in flight; no new work was created.
    Deduplicated {
        /// The job id of the in-flight work.
        job_id: JobId,
    },
}

impl Submission {
    /// The job id the caller should track, new or attached.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        match self {
            Self::Accepted { job_id } | Self::Deduplicated { job_id } => *job_id,
        }
    }
}

/// Per-entry outcome of a bulk reprocess.
#[derive(Debug)]
pub struct ReprocessOutcome {
    /// The dead-letter entry acted on.
    pub entry_id: DeadLetterId,
    /// New lineage id, or why this entry was skipped.
    pub result: RelayResult<JobId>,
}

struct JobTypeSpec {
    handler: Arc<dyn JobHandler>,
    resource: Option<String>,
    scheduler: RetryScheduler,
    idempotency: IdempotencyConfig,
}

struct Inner {
    config: RelayConfig,
    queue: Arc<dyn JobQueue>,
    job_types: RwLock<HashMap<String, Arc<JobTypeSpec>>>,
    guard: IdempotencyGuard,
    policy: AdmissionPolicy,
    tracker: ExecutionTracker,
    dead_letters: DeadLetterStore,
    cancellations: CancellationRegistry,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_seq: AtomicUsize,
}

/// The resilience layer's front door.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Wire a dispatcher over the shared store and queue collaborator.
    #[must_use]
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn SharedStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&store), config.rate_limits.clone());
        let breaker = CircuitBreaker::new(Arc::clone(&store), config.circuit.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                job_types: RwLock::new(HashMap::new()),
                guard: IdempotencyGuard::new(Arc::clone(&store)),
                policy: AdmissionPolicy::new(Arc::new(limiter), Arc::new(breaker)),
                tracker: ExecutionTracker::new(Arc::clone(&store)),
                dead_letters: DeadLetterStore::new(store),
                cancellations: CancellationRegistry::new(),
                workers: Mutex::new(Vec::new()),
                worker_seq: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a job type under its logical name.
    ///
    /// Retry curve, idempotency TTL, and the protected resource come from
    /// the configuration's per-job-type overrides.
    pub fn register(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        let config = &self.inner.config;
        let spec = JobTypeSpec {
            handler,
            resource: config
                .job_types
                .get(job_type)
                .and_then(|o| o.resource.clone()),
            scheduler: RetryScheduler::new(config.retry_for(job_type).clone()),
            idempotency: config.idempotency_for(job_type).clone(),
        };
        self.inner
            .job_types
            .write()
            .insert(job_type.to_string(), Arc::new(spec));
        info!(job_type = job_type, "Job type registered");
    }

    fn spec(&self, job_type: &str) -> RelayResult<Arc<JobTypeSpec>> {
        self.inner
            .job_types
            .read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| RelayError::UnknownJobType(job_type.to_string()))
    }

    /// Submit a job for execution.
    ///
    /// With a dedup key, a duplicate submission inside the key's TTL does
    /// not start new work; it returns [`Submission::Deduplicated`] carrying
    /// the in-flight job's id.
    ///
    /// # Errors
    ///
    /// Fails if the job type is unregistered or the shared store is
    /// unreachable.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        dedup_key: Option<&str>,
    ) -> RelayResult<Submission> {
        let spec = self.spec(job_type)?;
        let job_id = JobId::new();

        if let Some(key) = dedup_key {
            match self
                .inner
                .guard
                .acquire(key, job_id, spec.idempotency.ttl())
                .await?
            {
                AcquireOutcome::Acquired => {}
                AcquireOutcome::AlreadyInFlight { owner } => {
                    return Ok(Submission::Deduplicated { job_id: owner });
                }
            }
        }

        let record = JobRecord::new(
            job_id,
            job_type,
            DEFAULT_QUEUE,
            dedup_key.map(ToString::to_string),
        );
        self.inner.tracker.record_submitted(&record).await;

        let envelope = JobEnvelope {
            job_id,
            job_type: job_type.to_string(),
            payload,
            dedup_key: dedup_key.map(ToString::to_string),
            attempt_number: 1,
            budget_used: 0,
        };
        self.inner.queue.enqueue(envelope, Utc::now()).await?;
        info!(job_id = %job_id, job_type = job_type, "Job submitted");
        Ok(Submission::Accepted { job_id })
    }

    /// Client-facing status of a job, including its full attempt history.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownJob`] if no ledger exists for the id.
    pub async fn get_status(&self, job_id: JobId) -> RelayResult<JobStatusReport> {
        self.inner
            .tracker
            .status(job_id)
            .await?
            .ok_or_else(|| RelayError::UnknownJob(job_id.to_string()))
    }

    /// The full attempt ledger of a job.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownJob`] if no ledger exists for the id.
    pub async fn job_record(&self, job_id: JobId) -> RelayResult<JobRecord> {
        self.inner
            .tracker
            .record(job_id)
            .await?
            .ok_or_else(|| RelayError::UnknownJob(job_id.to_string()))
    }

    /// Cancel a job lineage.
    ///
    /// An in-flight attempt is signalled cooperatively through its token; a
    /// queued attempt is skipped when a worker next picks it up. The dedup
    /// key, if any, is released so a fresh submission can start over.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownJob`] if no ledger exists for the id.
    pub async fn cancel(&self, job_id: JobId) -> RelayResult<()> {
        let record = self.job_record(job_id).await?;
        let signalled = self.inner.cancellations.cancel(&job_id);
        self.inner.tracker.record_cancelled(job_id).await;
        if let Some(key) = &record.dedup_key {
            self.inner.guard.release(key).await?;
        }
        info!(
            job_id = %job_id,
            in_flight = signalled,
            "Job cancelled"
        );
        Ok(())
    }

    /// Start a fresh lineage from one dead-letter entry.
    ///
    /// The new job gets a new id and a full retry budget; the entry is
    /// marked reprocessed and stays in the store. Reprocessing the same
    /// entry twice fails with [`RelayError::AlreadyReprocessed`].
    ///
    /// # Errors
    ///
    /// Fails if the entry is unknown or already reprocessed, or if the
    /// entry's job type is no longer registered.
    pub async fn reprocess(&self, entry_id: DeadLetterId) -> RelayResult<JobId> {
        let entry = self
            .inner
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or_else(|| RelayError::UnknownDeadLetter(entry_id.to_string()))?;
        let _spec = self.spec(&entry.job_type)?;

        let new_job_id = JobId::new();
        // Winner-takes-all marking happens before any new work exists, so
        // two racing operators cannot both start a lineage.
        self.inner
            .dead_letters
            .mark_reprocessed(entry_id, new_job_id)
            .await?;

        let record = JobRecord::new(new_job_id, &entry.job_type, &entry.queue, None);
        self.inner.tracker.record_submitted(&record).await;
        let envelope = JobEnvelope {
            job_id: new_job_id,
            job_type: entry.job_type.clone(),
            payload: entry.payload.clone(),
            dedup_key: None,
            attempt_number: 1,
            budget_used: 0,
        };
        self.inner.queue.enqueue(envelope, Utc::now()).await?;
        info!(
            dead_letter_id = %entry_id,
            original_job_id = %entry.job_id,
            new_job_id = %new_job_id,
            job_type = %entry.job_type,
            "Dead-letter entry reprocessed"
        );
        Ok(new_job_id)
    }

    /// Reprocess every unprocessed entry matching the filter.
    ///
    /// Each entry succeeds or fails on its own; one bad entry never aborts
    /// the batch.
    ///
    /// # Errors
    ///
    /// Fails only if the dead-letter index itself is unreachable.
    pub async fn reprocess_matching(
        &self,
        job_type: Option<&str>,
        limit: Option<usize>,
    ) -> RelayResult<Vec<ReprocessOutcome>> {
        let filter = DeadLetterFilter {
            job_type: job_type.map(ToString::to_string),
            include_reprocessed: false,
            limit,
        };
        let entries = self.inner.dead_letters.list(&filter).await?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.reprocess(entry.id).await;
            outcomes.push(ReprocessOutcome {
                entry_id: entry.id,
                result,
            });
        }
        Ok(outcomes)
    }

    /// The execution tracker (stats, metrics exposition).
    #[must_use]
    pub fn tracker(&self) -> &ExecutionTracker {
        &self.inner.tracker
    }

    /// The dead-letter store (operational surface).
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.inner.dead_letters
    }

    /// The circuit breaker registry (operator overrides, snapshots).
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.inner.policy.breaker()
    }

    /// Envelopes waiting in the queue, due or delayed.
    ///
    /// # Errors
    ///
    /// Fails if the queue cannot report its depth.
    pub async fn queue_depth(&self) -> RelayResult<u64> {
        self.inner.queue.depth().await
    }

    /// Spawn `count` worker loops on the current tokio runtime.
    pub fn spawn_workers(&self, count: usize) {
        let mut workers = self.inner.workers.lock();
        for _ in 0..count {
            let n = self.inner.worker_seq.fetch_add(1, Ordering::Relaxed);
            let worker_id = format!("worker-{n}");
            let dispatcher = self.clone();
            workers.push(tokio::spawn(async move {
                dispatcher.worker_loop(&worker_id).await;
            }));
        }
    }

    /// Stop taking work and drain in-flight attempts.
    ///
    /// After `drain_timeout`, stragglers are cancelled cooperatively and
    /// left to bail out on their own.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.inner.queue.close();
        let handles: Vec<_> = {
            let mut workers = self.inner.workers.lock();
            workers.drain(..).collect()
        };
        info!(workers = handles.len(), "Dispatcher shutting down");

        let drained = tokio::time::timeout(drain_timeout, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            let stragglers = self.inner.cancellations.cancel_all();
            warn!(
                in_flight = stragglers,
                "Drain timeout elapsed; stragglers cancelled cooperatively"
            );
        }
    }

    async fn worker_loop(&self, worker_id: &str) {
        debug!(worker_id = worker_id, "Worker started");
        loop {
            let envelope = match self.inner.queue.dequeue().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = worker_id, error = %e, "Dequeue failed");
                    break;
                }
            };
            let job_id = envelope.job_id;
            if let Err(e) = self.process(envelope, worker_id).await {
                error!(
                    worker_id = worker_id,
                    job_id = %job_id,
                    error = %e,
                    "Attempt processing failed"
                );
            }
        }
        debug!(worker_id = worker_id, "Worker stopped");
    }

    /// Run one delivered envelope through admission, execution, and outcome
    /// routing.
    async fn process(&self, envelope: JobEnvelope, worker_id: &str) -> RelayResult<()> {
        if let Ok(Some(record)) = self.inner.tracker.record(envelope.job_id).await {
            // A lineage cancelled while queued is skipped, not executed. The
            // tracker already settled the open attempt when cancel() ran.
            if record.cancelled {
                debug!(job_id = %envelope.job_id, "Skipping cancelled job");
                return Ok(());
            }
            // A settled terminal attempt means this delivery is the retry of
            // a failed dead-letter admission. Finish that bookkeeping; the
            // body never runs again.
            if let Some(last) = record.last_attempt() {
                if last.status == AttemptStatus::FailedTerminal {
                    let kind = last.error_kind.unwrap_or(ErrorKind::Retryable);
                    let detail = last.error_detail.clone().unwrap_or_default();
                    let spec = self.spec(&envelope.job_type).ok();
                    return self
                        .admit_dead_letter(&envelope, spec.as_deref(), kind, detail)
                        .await;
                }
            }
        }

        let Ok(spec) = self.spec(&envelope.job_type) else {
            // Registration disappeared between submit and execution (e.g. a
            // reprocess against a retired deployment). Terminal by definition.
            return self
                .finish_terminal(
                    &envelope,
                    None,
                    ErrorKind::Permanent,
                    format!("job type {} is not registered", envelope.job_type),
                )
                .await;
        };

        let resource = spec.resource.as_deref();
        let admission = match self.inner.policy.admit(resource).await {
            Ok(admission) => admission,
            Err(e) => {
                // Gate state unreachable; hold the attempt rather than run
                // unprotected.
                warn!(job_id = %envelope.job_id, error = %e, "Admission check failed; deferring");
                return self.defer(envelope, STORE_RETRY_DELAY).await;
            }
        };

        let probe = match admission {
            Admission::Execute { probe } => probe,
            Admission::Defer {
                retry_after,
                reason,
            } => {
                debug!(
                    job_id = %envelope.job_id,
                    job_type = %envelope.job_type,
                    reason = reason.name(),
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Attempt deferred"
                );
                return self.defer(envelope, retry_after).await;
            }
        };

        let token = CancellationToken::new();
        self.inner.cancellations.register(envelope.job_id, token.clone());
        self.inner
            .tracker
            .record_started(envelope.job_id, envelope.attempt_number, worker_id)
            .await;
        info!(
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            attempt = envelope.attempt_number,
            worker_id = worker_id,
            probe = probe,
            "Attempt started"
        );

        let outcome = spec.handler.execute(&envelope.payload, &token).await;
        self.inner.cancellations.unregister(&envelope.job_id);

        if token.is_cancelled() {
            // The body bailed out (or its result is moot); the lineage ends
            // here regardless of what it returned. A cancelled probe reports
            // no outcome, so its slot is handed back explicitly.
            if let Err(e) = self.inner.policy.abandon(resource, probe).await {
                warn!(job_id = %envelope.job_id, error = %e, "Probe release failed");
            }
            self.inner
                .tracker
                .record_completed(
                    envelope.job_id,
                    envelope.attempt_number,
                    AttemptStatus::Cancelled,
                    None,
                    None,
                )
                .await;
            self.release_dedup(&envelope, &spec).await;
            info!(job_id = %envelope.job_id, "Attempt ended by cancellation");
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                self.finish_success(&envelope, &spec, resource, probe, result)
                    .await
            }
            Err(job_error) => {
                self.route_failure(envelope, &spec, resource, probe, job_error)
                    .await
            }
        }
    }

    async fn finish_success(
        &self,
        envelope: &JobEnvelope,
        spec: &JobTypeSpec,
        resource: Option<&str>,
        probe: bool,
        result: serde_json::Value,
    ) -> RelayResult<()> {
        if let Err(e) = self.inner.policy.observe(resource, probe, None).await {
            warn!(job_id = %envelope.job_id, error = %e, "Circuit report failed");
        }
        let result_ref = serde_json::to_string(&result).ok();
        self.inner
            .tracker
            .record_completed(
                envelope.job_id,
                envelope.attempt_number,
                AttemptStatus::Succeeded,
                None,
                result_ref,
            )
            .await;
        self.release_dedup(envelope, spec).await;
        info!(
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            attempt = envelope.attempt_number,
            "Job succeeded"
        );
        Ok(())
    }

    async fn route_failure(
        &self,
        mut envelope: JobEnvelope,
        spec: &JobTypeSpec,
        resource: Option<&str>,
        probe: bool,
        job_error: JobError,
    ) -> RelayResult<()> {
        let kind = job_error.kind();
        let detail = job_error.detail().to_string();
        if let Err(e) = self.inner.policy.observe(resource, probe, Some(kind)).await {
            warn!(job_id = %envelope.job_id, error = %e, "Circuit report failed");
        }

        let budget_used = if kind.consumes_retry_budget() {
            envelope.budget_used + 1
        } else {
            envelope.budget_used
        };

        let decision = spec.scheduler.next_action(budget_used, kind);
        // A downstream-provided retry-after hint beats the scheduler's
        // default deferral for throttles.
        let decision = match (&job_error, decision) {
            (
                JobError::Throttled {
                    retry_after: Some(hint),
                    ..
                },
                RetryDecision::RetryAfter(_),
            ) => RetryDecision::RetryAfter(*hint),
            (_, decision) => decision,
        };

        match decision {
            RetryDecision::RetryAfter(delay) => {
                self.inner
                    .tracker
                    .record_completed(
                        envelope.job_id,
                        envelope.attempt_number,
                        AttemptStatus::FailedRetryable,
                        Some((kind, detail.clone())),
                        None,
                    )
                    .await;
                let next_attempt = envelope.attempt_number + 1;
                self.inner
                    .tracker
                    .record_attempt_queued(envelope.job_id, next_attempt)
                    .await;
                info!(
                    job_id = %envelope.job_id,
                    job_type = %envelope.job_type,
                    attempt = envelope.attempt_number,
                    next_attempt = next_attempt,
                    error_kind = %kind,
                    error = %detail,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retry scheduled"
                );
                envelope.attempt_number = next_attempt;
                envelope.budget_used = budget_used;
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                self.inner.queue.enqueue(envelope, run_at).await
            }
            RetryDecision::GiveUp => {
                self.finish_terminal(&envelope, Some(spec), kind, detail)
                    .await
            }
        }
    }

    async fn finish_terminal(
        &self,
        envelope: &JobEnvelope,
        spec: Option<&JobTypeSpec>,
        kind: ErrorKind,
        detail: String,
    ) -> RelayResult<()> {
        self.inner
            .tracker
            .record_completed(
                envelope.job_id,
                envelope.attempt_number,
                AttemptStatus::FailedTerminal,
                Some((kind, detail.clone())),
                None,
            )
            .await;
        self.admit_dead_letter(envelope, spec, kind, detail).await
    }

    /// Write the dead-letter entry for a terminally failed job and release
    /// its dedup key.
    ///
    /// Admission failures redeliver the envelope instead of propagating:
    /// `process` recognizes the settled terminal attempt on redelivery and
    /// retries the admission without executing the body again.
    async fn admit_dead_letter(
        &self,
        envelope: &JobEnvelope,
        spec: Option<&JobTypeSpec>,
        kind: ErrorKind,
        detail: String,
    ) -> RelayResult<()> {
        // The ledger may be degraded; dead-letter from a synthesized record
        // rather than losing the job.
        let record = match self.inner.tracker.record(envelope.job_id).await {
            Ok(Some(record)) => record,
            _ => JobRecord::new(
                envelope.job_id,
                &envelope.job_type,
                DEFAULT_QUEUE,
                envelope.dedup_key.clone(),
            ),
        };
        let entry =
            DeadLetterEntry::from_failure(&record, envelope.payload.clone(), kind, detail);
        if let Err(e) = self.inner.dead_letters.admit(&entry).await {
            warn!(
                job_id = %envelope.job_id,
                job_type = %envelope.job_type,
                error = %e,
                "Dead-letter admission failed; redelivering"
            );
            return self.defer(envelope.clone(), STORE_RETRY_DELAY).await;
        }

        if let Some(spec) = spec {
            self.release_dedup(envelope, spec).await;
        } else if let Some(key) = &envelope.dedup_key {
            let _ = self.inner.guard.release(key).await;
        }
        Ok(())
    }

    async fn release_dedup(&self, envelope: &JobEnvelope, spec: &JobTypeSpec) {
        if !spec.idempotency.release_on_terminal {
            return;
        }
        if let Some(key) = &envelope.dedup_key {
            if let Err(e) = self.inner.guard.release(key).await {
                // The TTL will reap it; terminal outcomes must not fail on
                // lock cleanup.
                warn!(job_id = %envelope.job_id, dedup_key = %key, error = %e, "Dedup release failed");
            }
        }
    }

    async fn defer(&self, envelope: JobEnvelope, retry_after: Duration) -> RelayResult<()> {
        let run_at =
            Utc::now() + chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::MAX);
        self.inner.queue.enqueue(envelope, run_at).await
    }
}
