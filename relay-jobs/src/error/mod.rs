//! Error types and the job failure taxonomy.
//!
//! Two error surfaces live here:
//!
//! - [`RelayError`]: faults of the resilience layer itself (shared-state
//!   backend unavailable, bad configuration, unknown job type). These are
//!   infrastructure errors: they degrade to logging where possible and never
//!   masquerade as job failures.
//! - [`JobError`]: the classification a job body must attach to its own
//!   failures. Retry eligibility is decided from this tag alone; the layer
//!   never guesses intent from error text.

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Library error type for faults of the resilience layer itself.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store error
    #[error("Shared store error: {0}")]
    Store(#[from] StoreError),

    /// Payload or record serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Submitted job names a type no handler was registered for
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Job lookup failed
    #[error("Unknown job id: {0}")]
    UnknownJob(String),

    /// Dead-letter entry lookup failed
    #[error("Unknown dead-letter entry: {0}")]
    UnknownDeadLetter(String),

    /// Dead-letter entry was already reprocessed
    #[error("Dead-letter entry {0} was already reprocessed")]
    AlreadyReprocessed(String),

    /// Queue collaborator rejected or closed
    #[error("Queue error: {0}")]
    Queue(String),
}

/// Result alias for resilience-layer operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Failure classification attached by the job body.
///
/// The job body is the only party that knows whether a failure is worth
/// retrying. It must tag every error; the layer routes on the tag:
///
/// - [`JobError::Retryable`] consumes retry budget and feeds the circuit
///   breaker's failure counter.
/// - [`JobError::Permanent`] goes straight to the dead-letter store.
/// - [`JobError::Throttled`] defers the job without penalty to either the
///   retry budget or the breaker.
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; eligible for backoff retry.
    #[error("Retryable failure: {message}")]
    Retryable {
        /// Human-readable failure description.
        message: String,
    },

    /// Validation or logic failure; retrying cannot succeed.
    #[error("Permanent failure: {message}")]
    Permanent {
        /// Human-readable failure description.
        message: String,
    },

    /// Downstream asked us to slow down; not a failure.
    #[error("Throttled: {message}")]
    Throttled {
        /// Suggested wait before the next try, if the downstream provided one.
        retry_after: Option<Duration>,
        /// Human-readable description.
        message: String,
    },
}

impl JobError {
    /// Construct a retryable failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Construct a permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Construct a throttle signal.
    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Throttled {
            retry_after,
            message: message.into(),
        }
    }

    /// The serializable classification tag for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Retryable { .. } => ErrorKind::Retryable,
            Self::Permanent { .. } => ErrorKind::Permanent,
            Self::Throttled { .. } => ErrorKind::Throttled,
        }
    }

    /// The failure description without the classification prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Retryable { message }
            | Self::Permanent { message }
            | Self::Throttled { message, .. } => message,
        }
    }
}

/// Result alias for job bodies.
pub type JobResult<T> = Result<T, JobError>;

/// Serializable classification of a job failure, retained on attempt records
/// and dead-letter entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient; retry may succeed.
    Retryable,
    /// Permanent; retry cannot succeed.
    Permanent,
    /// Deferred by throttling; not a failure.
    Throttled,
}

impl ErrorKind {
    /// Whether failures of this kind consume retry budget.
    #[must_use]
    pub const fn consumes_retry_budget(&self) -> bool {
        matches!(self, Self::Retryable)
    }

    /// Human-readable tag name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::Throttled => "throttled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
