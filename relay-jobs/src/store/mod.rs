//! Shared state storage for the worker fleet.
//!
//! Every piece of coordination state (idempotency records, circuit states,
//! rate-limit windows, attempt ledgers, dead-letter entries) lives behind
//! the [`SharedStore`] trait. Components never hold
//! state in ambient globals; they read and mutate through the store's atomic
//! primitives so that two workers racing on the same key resolve to exactly
//! one winner.
//!
//! Two backends ship:
//!
//! - [`memory::MemoryStore`]: in-process, for tests and single-worker
//!   embeddings. Linearizable within the process, nothing more.
//! - [`redis::RedisStore`] (feature `redis`): required once more than one
//!   worker process exists; conditional writes go through server-side
//!   scripts so the check and the write are one atomic step.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or returned a protocol-level failure
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Connection pool exhausted or unavailable
    #[error("Store pool error: {0}")]
    Pool(String),

    /// Stored value did not match the expected encoding
    #[error("Corrupt store value at {key}: {detail}")]
    Corrupt {
        /// Key holding the bad value.
        key: String,
        /// What was wrong with it.
        detail: String,
    },
}

/// A stored value with its write version.
///
/// Versions start at 1 and increment on every successful write to the key.
/// [`SharedStore::compare_and_swap`] uses them to detect lost updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Write version of the value.
    pub version: u64,
    /// The value itself (components store JSON here).
    pub data: String,
}

/// Outcome of [`SharedStore::put_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutIfAbsent {
    /// The key was absent; this call inserted it.
    Inserted,
    /// A live value already exists; it is returned unchanged.
    Occupied(Versioned),
}

/// Outcome of [`SharedStore::compare_and_swap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The swap applied; the new version is returned.
    Swapped(u64),
    /// The expected version did not match; the caller should re-read.
    Conflict,
}

/// Result of a windowed counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Calls observed in the current window, including this one.
    pub count: u64,
    /// Time until the current window resets.
    pub resets_in: Duration,
}

/// Atomic key-value contract shared by all resilience components.
///
/// Implementations must make the conditional operations
/// ([`put_if_absent`](Self::put_if_absent),
/// [`compare_and_swap`](Self::compare_and_swap),
/// [`incr_window`](Self::incr_window))
/// atomic with respect to concurrent callers; read-modify-write races are a
/// correctness bug, not a performance concern.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value. Expired values read as absent.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditionally write a value, resetting its version to 1.
    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Insert only if no live value exists; atomic winner-takes-all.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<PutIfAbsent, StoreError>;

    /// Replace the value only if its version still equals `expected`.
    ///
    /// `expected = None` means "create; fail if the key exists".
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<CasOutcome, StoreError>;

    /// Remove a key. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment the fixed-window counter for `key`.
    ///
    /// The window boundary is derived from wall-clock time so that all
    /// workers agree on it without coordination.
    async fn incr_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError>;

    /// Append a value to a list. Returns the new list length.
    async fn append(&self, list: &str, value: &str) -> Result<u64, StoreError>;

    /// Read a whole list, oldest first.
    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError>;

    /// Drop the oldest elements of a list so at most `keep_last` remain.
    ///
    /// Trimming an absent list is a no-op.
    async fn list_trim(&self, list: &str, keep_last: u64) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_count_fields() {
        let wc = WindowCount {
            count: 3,
            resets_in: Duration::from_secs(10),
        };
        assert_eq!(wc.count, 3);
        assert_eq!(wc.resets_in, Duration::from_secs(10));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Corrupt {
            key: "circuit:backend-a".to_string(),
            detail: "not json".to_string(),
        };
        assert!(err.to_string().contains("circuit:backend-a"));
    }
}
