//! End-to-end tests for the resilience pipeline.
//!
//! Each test wires a full dispatcher over the in-memory store and queue and
//! drives jobs through submission, admission, execution, and settlement.

use std::sync::Arc;
use std::time::Duration;

use relay_jobs::config::{CircuitConfig, JobTypeOverrides, RateLimitConfig, RetryConfig};
use relay_jobs::prelude::*;
use relay_jobs::store::memory::MemoryStore;
use relay_jobs::store::SharedStore;
use relay_jobs::testing::{
    wait_for_terminal, FlakyHandler, RecordingHandler, ScriptedHandler, ThrottledHandler,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> RelayConfig {
    RelayConfig {
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 5,
            growth_factor: 1.0,
            max_delay_ms: 10,
            jitter_fraction: 0.0,
        },
        ..RelayConfig::default()
    }
}

fn dispatcher_on(store: Arc<dyn SharedStore>, config: RelayConfig) -> Dispatcher {
    Dispatcher::new(config, store, Arc::new(InMemoryQueue::new()))
}

#[tokio::test]
async fn happy_path_records_a_full_ledger() {
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), fast_config());
    let handler = Arc::new(RecordingHandler::new());
    dispatcher.register("echo", Arc::clone(&handler) as Arc<dyn JobHandler>);
    dispatcher.spawn_workers(2);

    let job_id = dispatcher
        .submit("echo", serde_json::json!({ "n": 42 }), None)
        .await
        .unwrap()
        .job_id();

    let report = wait_for_terminal(&dispatcher, job_id, WAIT).await;
    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(handler.received(), vec![serde_json::json!({ "n": 42 })]);

    let record = dispatcher.job_record(job_id).await.unwrap();
    assert!(record.last_attempt().unwrap().completed_at.is_some());

    let stats = dispatcher
        .tracker()
        .stats("echo", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.success_count, 1);
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);

    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn exhausted_budget_dead_letters_then_reprocesses() {
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), fast_config());
    // Fails 4 times; max_retries = 3 means the lineage dies on attempt 4,
    // so the handler has recovered by the time an operator reprocesses.
    dispatcher.register("ingest", Arc::new(FlakyHandler::new(4)));
    dispatcher.spawn_workers(1);

    let job_id = dispatcher
        .submit("ingest", serde_json::json!({ "batch": 9 }), None)
        .await
        .unwrap()
        .job_id();
    let report = wait_for_terminal(&dispatcher, job_id, WAIT).await;
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.attempt_count, 4);

    let entries = dispatcher
        .dead_letters()
        .list(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.job_id, job_id);
    assert_eq!(entry.job_type, "ingest");
    assert_eq!(entry.total_attempts, 4);
    assert_eq!(entry.error_kind, ErrorKind::Retryable);
    assert_eq!(entry.payload, serde_json::json!({ "batch": 9 }));

    let new_job_id = dispatcher.reprocess(entry.id).await.unwrap();
    let report = wait_for_terminal(&dispatcher, new_job_id, WAIT).await;
    assert_eq!(report.status, JobStatus::Succeeded);

    // The entry survives as history and cannot run a second time.
    let entry = dispatcher.dead_letters().get(entry.id).await.unwrap().unwrap();
    assert!(entry.reprocessed);
    assert_eq!(entry.reprocessed_as, Some(new_job_id));
    assert!(matches!(
        dispatcher.reprocess(entry.id).await,
        Err(RelayError::AlreadyReprocessed(_))
    ));

    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn circuit_opens_then_recovers_through_a_probe() {
    let mut config = fast_config();
    config.circuit = CircuitConfig {
        failure_threshold: 2,
        reset_timeout_secs: 1,
    };
    config.retry.max_retries = 1;
    config.job_types.insert(
        "payment".to_string(),
        JobTypeOverrides {
            resource: Some("gateway".to_string()),
            ..Default::default()
        },
    );
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), config);
    // Two failures trip the circuit; later calls succeed, so the first
    // probe after the reset timeout closes it again.
    dispatcher.register("payment", Arc::new(FlakyHandler::new(2)));
    dispatcher.spawn_workers(1);

    let first = dispatcher
        .submit("payment", serde_json::json!({ "order": 1 }), None)
        .await
        .unwrap()
        .job_id();
    let report = wait_for_terminal(&dispatcher, first, WAIT).await;
    // max_retries = 1 allows two attempts, both of which fail.
    assert_eq!(report.status, JobStatus::Failed);

    let snapshot = dispatcher.breaker().snapshot("gateway").await.unwrap();
    assert_eq!(snapshot.state, CircuitState::Open);

    // The next job defers while open, probes after the timeout, and the
    // successful probe closes the circuit.
    let second = dispatcher
        .submit("payment", serde_json::json!({ "order": 2 }), None)
        .await
        .unwrap()
        .job_id();
    let report = wait_for_terminal(&dispatcher, second, WAIT).await;
    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(report.attempt_count, 1);

    let snapshot = dispatcher.breaker().snapshot("gateway").await.unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);

    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn rate_limit_defers_excess_without_burning_budget() {
    let mut config = fast_config();
    config.rate_limits.insert(
        "mailer".to_string(),
        RateLimitConfig {
            max_calls: 2,
            window_secs: 1,
        },
    );
    config.job_types.insert(
        "notify".to_string(),
        JobTypeOverrides {
            resource: Some("mailer".to_string()),
            ..Default::default()
        },
    );
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), config);
    dispatcher.register("notify", Arc::new(RecordingHandler::new()));
    dispatcher.spawn_workers(4);

    let mut job_ids = Vec::new();
    for n in 0..5 {
        let job_id = dispatcher
            .submit("notify", serde_json::json!({ "n": n }), None)
            .await
            .unwrap()
            .job_id();
        job_ids.push(job_id);
    }

    for job_id in job_ids {
        let report = wait_for_terminal(&dispatcher, job_id, WAIT).await;
        assert_eq!(report.status, JobStatus::Succeeded);
        // Deferrals re-deliver the same attempt; the ledger shows one row.
        assert_eq!(report.attempt_count, 1);
    }

    let stats = dispatcher
        .tracker()
        .stats("notify", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(stats.count, 5);
    assert_eq!(stats.success_count, 5);

    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn throttles_retry_without_consuming_the_budget() {
    let mut config = fast_config();
    // No retryable budget at all; only the throttle path can keep the job
    // alive long enough to succeed on the third delivery.
    config.retry.max_retries = 0;
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), config);
    dispatcher.register(
        "export",
        Arc::new(ThrottledHandler::new(
            2,
            Some(Duration::from_millis(20)),
        )),
    );
    dispatcher.spawn_workers(1);

    let job_id = dispatcher
        .submit("export", serde_json::json!({}), None)
        .await
        .unwrap()
        .job_id();
    let report = wait_for_terminal(&dispatcher, job_id, WAIT).await;
    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(report.attempt_count, 3);

    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn permanent_failures_bypass_the_retry_curve() {
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), fast_config());
    dispatcher.register(
        "validate",
        Arc::new(ScriptedHandler::new(vec![Err(JobError::permanent(
            "schema mismatch",
        ))])),
    );
    dispatcher.spawn_workers(1);

    let job_id = dispatcher
        .submit("validate", serde_json::json!({ "doc": 1 }), None)
        .await
        .unwrap()
        .job_id();
    let report = wait_for_terminal(&dispatcher, job_id, WAIT).await;
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.attempt_count, 1);

    let entries = dispatcher
        .dead_letters()
        .list(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(entries[0].error_kind, ErrorKind::Permanent);
    assert_eq!(entries[0].error_detail, "schema mismatch");

    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn dedup_holds_across_dispatchers_sharing_a_store() {
    // Two processes sharing one store coordinate through the same keys.
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = dispatcher_on(Arc::clone(&store), fast_config());
    let b = dispatcher_on(Arc::clone(&store), fast_config());
    a.register("sync", Arc::new(RecordingHandler::new()));
    b.register("sync", Arc::new(RecordingHandler::new()));
    // No workers anywhere; the first submission stays in flight.

    let first = a
        .submit("sync", serde_json::json!({}), Some("tenant:42"))
        .await
        .unwrap();
    let second = b
        .submit("sync", serde_json::json!({}), Some("tenant:42"))
        .await
        .unwrap();

    assert!(matches!(first, Submission::Accepted { .. }));
    assert_eq!(
        second,
        Submission::Deduplicated {
            job_id: first.job_id()
        }
    );
}

#[tokio::test]
async fn metrics_exposition_covers_tracked_job_types() {
    let dispatcher = dispatcher_on(Arc::new(MemoryStore::new()), fast_config());
    dispatcher.register("echo", Arc::new(RecordingHandler::new()));
    dispatcher.spawn_workers(1);

    let job_id = dispatcher
        .submit("echo", serde_json::json!({}), None)
        .await
        .unwrap()
        .job_id();
    wait_for_terminal(&dispatcher, job_id, WAIT).await;

    let rendered = dispatcher
        .tracker()
        .render_metrics(&["echo"], Duration::from_secs(60))
        .await
        .unwrap();
    assert!(rendered.contains("relay_jobs_attempts_total{job_type=\"echo\"} 1"));
    assert!(rendered.contains("relay_jobs_tracker_degraded 0"));

    dispatcher.shutdown(Duration::from_secs(1)).await;
}
