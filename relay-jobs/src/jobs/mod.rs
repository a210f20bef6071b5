//! Job identity, the job-body contract, and the per-job attempt ledger.
//!
//! A *job* is one unit of background work with a stable [`JobId`] across
//! retries. Each execution try is an attempt; the full attempt history lives
//! in a [`JobRecord`] owned by the execution tracker. The job body itself is
//! an external collaborator implementing [`JobHandler`]: the layer hands it
//! an opaque payload and routes on the [`JobError`](crate::error::JobError)
//! classification it returns.

mod attempt;
mod cancellation;
mod status;

pub use attempt::{AttemptStatus, JobAttempt, JobRecord};
pub use cancellation::{CancellationRegistry, CancellationToken};
pub use status::{JobStatus, JobStatusReport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobResult;

/// Stable identity of a job across all of its attempts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job id from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The external unit of work the layer executes.
///
/// Implementations must classify every failure via
/// [`JobError`](crate::error::JobError); the layer never inspects error
/// text. Long-running bodies should poll the cancellation token and bail out
/// cooperatively; the layer does not forcibly terminate work mid-flight.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use relay_jobs::error::{JobError, JobResult};
/// use relay_jobs::jobs::{CancellationToken, JobHandler};
/// use serde_json::Value;
///
/// struct ExportReport;
///
/// #[async_trait]
/// impl JobHandler for ExportReport {
///     async fn execute(
///         &self,
///         payload: &Value,
///         _cancel: &CancellationToken,
///     ) -> JobResult<Value> {
///         let report_id = payload["report_id"]
///             .as_str()
///             .ok_or_else(|| JobError::permanent("missing report_id"))?;
///         Ok(serde_json::json!({ "exported": report_id }))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job body against an opaque payload.
    async fn execute(
        &self,
        payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> JobResult<serde_json::Value>;
}
