//! relay-jobs: resilient background job execution over a shared store
//!
//! The layer sits between job producers and job handlers and makes
//! unreliable downstream work survivable:
//!
//! - **Idempotency guard**: duplicate submissions inside a dedup key's TTL
//!   attach to the in-flight job instead of starting new work
//! - **Rate limiter**: fixed-window caps per named downstream resource
//! - **Circuit breaker**: consecutive failures open the circuit; a single
//!   probe decides when traffic resumes
//! - **Retry scheduler**: exponential backoff with jitter, a hard budget,
//!   and throttle-aware deferrals that never consume the budget
//! - **Dead-letter store**: exhausted and permanently failed jobs are kept
//!   with full context for inspection and reprocessing
//! - **Execution tracker**: a per-job attempt ledger plus aggregate
//!   latency and success-rate statistics
//!
//! All coordination state lives behind the [`store::SharedStore`] trait so
//! a fleet of workers sharing one Redis behaves like a single dispatcher.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use relay_jobs::prelude::*;
//! use relay_jobs::store::memory::MemoryStore;
//!
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendEmail {
//!     async fn execute(
//!         &self,
//!         payload: &serde_json::Value,
//!         _cancel: &CancellationToken,
//!     ) -> JobResult<serde_json::Value> {
//!         // Talk to the mail provider here.
//!         Ok(serde_json::json!({ "sent": payload["to"] }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::load()?;
//!     let dispatcher = Dispatcher::new(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(InMemoryQueue::new()),
//!     );
//!     dispatcher.register("send_email", Arc::new(SendEmail));
//!     dispatcher.spawn_workers(4);
//!
//!     let submission = dispatcher
//!         .submit(
//!             "send_email",
//!             serde_json::json!({ "to": "a@example.com" }),
//!             Some("email:a@example.com:welcome"),
//!         )
//!         .await?;
//!     println!("tracking {}", submission.job_id());
//!
//!     dispatcher.shutdown(Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `redis` - Redis-backed shared store for multi-worker deployments (default)
//! - `otel-metrics` - OpenTelemetry export of attempt metrics

pub mod circuit;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod idempotency;
pub mod jobs;
pub mod policy;
pub mod rate_limit;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod tracker;

// Handler stubs and polling helpers; public so downstream crates can reuse
// them in their own integration tests.
pub mod testing;

pub mod prelude {
    //! Convenience re-exports for common types and traits
    //!
    //! # Examples
    //!
    //! ```rust
    //! use relay_jobs::prelude::*;
    //! ```

    // Front door
    pub use crate::runtime::{
        Dispatcher, InMemoryQueue, JobEnvelope, JobQueue, ReprocessOutcome, Submission,
    };

    // Job identity and handler contract
    pub use crate::jobs::{
        AttemptStatus, CancellationToken, JobHandler, JobId, JobRecord, JobStatus,
        JobStatusReport,
    };

    // Error types
    pub use crate::error::{ErrorKind, JobError, JobResult, RelayError, RelayResult};

    // Configuration
    pub use crate::config::RelayConfig;

    // Operational surfaces
    pub use crate::circuit::{CircuitSnapshot, CircuitState};
    pub use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterId};
    pub use crate::tracker::JobStats;
}
