//! Queue collaborator: delayed re-execution without sleeping a worker.
//!
//! The dispatcher never holds a worker hostage for a backoff delay; it hands
//! the queue an envelope plus a `run_at` timestamp and moves on. The broker
//! itself is out of scope, so [`JobQueue`] is a trait seam; the shipped
//! [`InMemoryQueue`] covers tests and single-process embeddings.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use crate::error::RelayResult;
use crate::jobs::JobId;

/// Everything a worker needs to run one attempt of a job.
///
/// The envelope is what travels through the queue; the attempt ledger stays
/// in the shared store. `budget_used` counts retryable failures so far and
/// is deliberately separate from `attempt_number`: throttles and admission
/// deferrals open new attempts (or re-deliver the same one) without touching
/// the budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Stable job identity across all attempts.
    pub job_id: JobId,
    /// Registered job type to execute.
    pub job_type: String,
    /// The submitted payload, opaque to the layer.
    pub payload: serde_json::Value,
    /// Dedup key to release on terminal outcomes, if one was supplied.
    pub dedup_key: Option<String>,
    /// 1-based ledger attempt this delivery will execute.
    pub attempt_number: u32,
    /// Retryable failures consumed so far.
    pub budget_used: u32,
}

/// Transport seam between the dispatcher and whatever carries jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue an envelope to become due at `run_at`.
    async fn enqueue(&self, envelope: JobEnvelope, run_at: DateTime<Utc>) -> RelayResult<()>;

    /// Wait for the next due envelope.
    ///
    /// Returns `Ok(None)` once the queue is closed; pending envelopes are
    /// abandoned at that point (a persistent transport would keep them).
    async fn dequeue(&self) -> RelayResult<Option<JobEnvelope>>;

    /// Envelopes currently waiting (due or delayed).
    async fn depth(&self) -> RelayResult<u64>;

    /// Close the queue, waking all blocked dequeuers.
    fn close(&self);
}

struct Scheduled {
    run_at_ms: i64,
    seq: u64,
    envelope: JobEnvelope,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.run_at_ms == other.run_at_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.run_at_ms, self.seq).cmp(&(other.run_at_ms, other.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
}

/// In-process delay queue: a min-heap on `run_at`, FIFO within a timestamp.
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    closed_tx: watch::Sender<bool>,
}

impl InMemoryQueue {
    /// Create an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            closed_tx,
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, envelope: JobEnvelope, run_at: DateTime<Utc>) -> RelayResult<()> {
        {
            let mut inner = self.inner.lock();
            let seq = inner.seq;
            inner.seq += 1;
            inner.heap.push(Reverse(Scheduled {
                run_at_ms: run_at.timestamp_millis(),
                seq,
                envelope,
            }));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> RelayResult<Option<JobEnvelope>> {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            if *closed_rx.borrow() {
                return Ok(None);
            }

            let wait_for = {
                let mut inner = self.inner.lock();
                let now = Self::now_ms();
                match inner.heap.peek() {
                    Some(Reverse(next)) if next.run_at_ms <= now => {
                        if let Some(Reverse(scheduled)) = inner.heap.pop() {
                            return Ok(Some(scheduled.envelope));
                        }
                        None
                    }
                    Some(Reverse(next)) => Some(std::time::Duration::from_millis(
                        u64::try_from(next.run_at_ms - now).unwrap_or(0),
                    )),
                    None => None,
                }
            };

            match wait_for {
                Some(delay) => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = tokio::time::sleep(delay) => {}
                        _ = closed_rx.changed() => {}
                    }
                }
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        _ = closed_rx.changed() => {}
                    }
                }
            }
        }
    }

    async fn depth(&self) -> RelayResult<u64> {
        Ok(u64::try_from(self.inner.lock().heap.len()).unwrap_or(u64::MAX))
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}
