//! Reusable fixtures for exercising the resilience pipeline in tests.
//!
//! Ships as a regular module so downstream crates can script failure
//! sequences against their own dispatcher wiring without re-implementing
//! handler stubs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{JobError, JobResult};
use crate::jobs::{CancellationToken, JobHandler, JobId, JobStatusReport};
use crate::runtime::Dispatcher;

/// Handler that replays a scripted sequence of outcomes, one per call.
///
/// Once the script is exhausted, every further call succeeds with `"ok"`.
pub struct ScriptedHandler {
    script: Mutex<VecDeque<JobResult<serde_json::Value>>>,
    calls: AtomicU32,
}

impl ScriptedHandler {
    /// Create a handler that plays `script` front to back.
    #[must_use]
    pub fn new(script: Vec<JobResult<serde_json::Value>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of times the handler has been invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn execute(
        &self,
        _payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> JobResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!("ok")))
    }
}

/// Handler that fails with a retryable error a fixed number of times, then
/// succeeds forever.
pub struct FlakyHandler {
    remaining: AtomicU32,
    calls: AtomicU32,
}

impl FlakyHandler {
    /// Create a handler that fails `failures` times before recovering.
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of times the handler has been invoked.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn execute(
        &self,
        _payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> JobResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(JobError::retryable("scripted transient failure"));
        }
        Ok(serde_json::json!("ok"))
    }
}

/// Handler that returns `Throttled` a fixed number of times, then succeeds.
pub struct ThrottledHandler {
    remaining: AtomicU32,
    retry_after: Option<Duration>,
}

impl ThrottledHandler {
    /// Create a handler throttled for the first `throttles` calls, carrying
    /// `retry_after` as the downstream's hint.
    #[must_use]
    pub fn new(throttles: u32, retry_after: Option<Duration>) -> Self {
        Self {
            remaining: AtomicU32::new(throttles),
            retry_after,
        }
    }
}

#[async_trait]
impl JobHandler for ThrottledHandler {
    async fn execute(
        &self,
        _payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> JobResult<serde_json::Value> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(JobError::throttled("downstream throttle", self.retry_after));
        }
        Ok(serde_json::json!("ok"))
    }
}

/// Handler that succeeds immediately, recording every payload it saw.
#[derive(Default)]
pub struct RecordingHandler {
    payloads: Mutex<Vec<serde_json::Value>>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads received so far, in execution order.
    #[must_use]
    pub fn received(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(
        &self,
        payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> JobResult<serde_json::Value> {
        self.payloads.lock().push(payload.clone());
        Ok(serde_json::json!({ "echo": payload }))
    }
}

/// Handler that parks until its cancellation token fires.
///
/// Exercises the cooperative cancellation path: the body observes the token
/// and bails out with a retryable error.
pub struct HangingHandler;

#[async_trait]
impl JobHandler for HangingHandler {
    async fn execute(
        &self,
        _payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> JobResult<serde_json::Value> {
        cancel.cancelled().await;
        Err(JobError::retryable("interrupted by cancellation"))
    }
}

/// Poll a job's status until it reaches a terminal state.
///
/// # Panics
///
/// Panics if the job is still non-terminal after `timeout`; tests treat
/// that as a hang.
pub async fn wait_for_terminal(
    dispatcher: &Dispatcher,
    job_id: JobId,
    timeout: Duration,
) -> JobStatusReport {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(report) = dispatcher.get_status(job_id).await {
            if report.status.is_terminal() {
                return report;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not reach a terminal state within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_handler_replays_then_succeeds() {
        let handler = ScriptedHandler::new(vec![
            Err(JobError::retryable("first")),
            Ok(serde_json::json!(1)),
        ]);
        let token = CancellationToken::new();
        let payload = serde_json::json!({});

        assert!(handler.execute(&payload, &token).await.is_err());
        assert_eq!(
            handler.execute(&payload, &token).await.unwrap(),
            serde_json::json!(1)
        );
        // Script exhausted; default success.
        assert!(handler.execute(&payload, &token).await.is_ok());
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn test_flaky_handler_recovers() {
        let handler = FlakyHandler::new(2);
        let token = CancellationToken::new();
        let payload = serde_json::json!({});

        assert!(handler.execute(&payload, &token).await.is_err());
        assert!(handler.execute(&payload, &token).await.is_err());
        assert!(handler.execute(&payload, &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_handler_captures_payloads() {
        let handler = RecordingHandler::new();
        let token = CancellationToken::new();
        handler
            .execute(&serde_json::json!({"n": 1}), &token)
            .await
            .unwrap();
        handler
            .execute(&serde_json::json!({"n": 2}), &token)
            .await
            .unwrap();
        assert_eq!(
            handler.received(),
            vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]
        );
    }

    #[tokio::test]
    async fn test_hanging_handler_returns_on_cancel() {
        let handler = HangingHandler;
        let token = CancellationToken::new();
        token.cancel();
        let result = handler.execute(&serde_json::json!({}), &token).await;
        assert!(result.is_err());
    }
}
