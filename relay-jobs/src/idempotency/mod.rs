//! Idempotency guard: at most one live execution per dedup key.
//!
//! A duplicate submission inside the TTL does not error; it returns the
//! owning job's identity so the caller can attach to the in-flight work.
//! Acquisition is a single atomic insert-if-absent against the shared store,
//! so N racing submissions resolve to exactly one winner. The TTL keeps a
//! crashed worker from pinning a key forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RelayResult;
use crate::jobs::JobId;
use crate::store::{PutIfAbsent, SharedStore};

/// Persisted lock document for one dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Job currently holding the key.
    pub owner: JobId,
    /// When the key was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This caller holds the key; execution may start.
    Acquired,
    /// Another job holds the key; attach to it instead of executing.
    AlreadyInFlight {
        /// The job that owns the key.
        owner: JobId,
    },
}

/// Duplicate-submission guard over the shared store.
pub struct IdempotencyGuard {
    store: Arc<dyn SharedStore>,
}

impl IdempotencyGuard {
    /// Create a guard backed by the given store.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn key(dedup_key: &str) -> String {
        format!("idem:{dedup_key}")
    }

    /// Try to acquire `dedup_key` for `owner`.
    ///
    /// Re-acquisition by the current owner succeeds, so a retrying job does
    /// not collide with its own lock.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unreachable.
    pub async fn acquire(
        &self,
        dedup_key: &str,
        owner: JobId,
        ttl: Duration,
    ) -> RelayResult<AcquireOutcome> {
        let record = IdempotencyRecord {
            owner,
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;

        match self
            .store
            .put_if_absent(&Self::key(dedup_key), &json, Some(ttl))
            .await?
        {
            PutIfAbsent::Inserted => {
                debug!(dedup_key = dedup_key, job_id = %owner, "Dedup key acquired");
                Ok(AcquireOutcome::Acquired)
            }
            PutIfAbsent::Occupied(existing) => {
                let existing: IdempotencyRecord = serde_json::from_str(&existing.data)?;
                if existing.owner == owner {
                    Ok(AcquireOutcome::Acquired)
                } else {
                    debug!(
                        dedup_key = dedup_key,
                        owner = %existing.owner,
                        "Duplicate submission attached to in-flight job"
                    );
                    Ok(AcquireOutcome::AlreadyInFlight {
                        owner: existing.owner,
                    })
                }
            }
        }
    }

    /// Release `dedup_key` after a terminal outcome.
    ///
    /// Releasing a key that already expired (or was never held) is a logical
    /// no-op, not an error. A worker may crash after the TTL lapses and the
    /// cleanup path must stay idempotent itself.
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unreachable.
    pub async fn release(&self, dedup_key: &str) -> RelayResult<()> {
        let removed = self.store.delete(&Self::key(dedup_key)).await?;
        if removed {
            debug!(dedup_key = dedup_key, "Dedup key released");
        }
        Ok(())
    }

    /// Current holder of a dedup key, if any (operational surface).
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared store is unreachable.
    pub async fn holder(&self, dedup_key: &str) -> RelayResult<Option<IdempotencyRecord>> {
        match self.store.get(&Self::key(dedup_key)).await? {
            Some(v) => Ok(Some(serde_json::from_str(&v.data)?)),
            None => Ok(None),
        }
    }
}
