//! In-process store backend.
//!
//! Backs tests and single-worker embeddings. All operations take a short
//! `parking_lot` lock; nothing is held across an await point, so the async
//! trait methods are non-blocking in practice.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    CasOutcome, PutIfAbsent, SharedStore, StoreError, Versioned, WindowCount,
};

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    data: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    bucket: u64,
    count: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    windows: HashMap<String, Window>,
    lists: HashMap<String, Vec<String>>,
}

/// In-memory [`SharedStore`] implementation.
///
/// Linearizable within one process only. Once multiple worker processes
/// share state, use the Redis backend instead.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read();
        Ok(inner
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| Versioned {
                version: e.version,
                data: e.data.clone(),
            }))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.entries.insert(
            key.to_string(),
            Entry {
                version: 1,
                data: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<PutIfAbsent, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.entries.get(key) {
            if !existing.is_expired(now) {
                return Ok(PutIfAbsent::Occupied(Versioned {
                    version: existing.version,
                    data: existing.data.clone(),
                }));
            }
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                version: 1,
                data: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(PutIfAbsent::Inserted)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<CasOutcome, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let live = inner
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.version);
        match (live, expected) {
            (None, None) => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        version: 1,
                        data: value.to_string(),
                        expires_at: None,
                    },
                );
                Ok(CasOutcome::Swapped(1))
            }
            (Some(current), Some(exp)) if current == exp => {
                let next = current + 1;
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        version: next,
                        data: value.to_string(),
                        expires_at: None,
                    },
                );
                Ok(CasOutcome::Swapped(next))
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        match inner.entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn incr_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let now_ms = unix_millis();
        let bucket = now_ms / window_ms;

        let mut inner = self.inner.write();
        let slot = inner
            .windows
            .entry(key.to_string())
            .or_insert(Window { bucket, count: 0 });
        if slot.bucket != bucket {
            slot.bucket = bucket;
            slot.count = 0;
        }
        slot.count += 1;
        let count = slot.count;
        drop(inner);

        let window_end_ms = (bucket + 1) * window_ms;
        Ok(WindowCount {
            count,
            resets_in: Duration::from_millis(window_end_ms.saturating_sub(now_ms)),
        })
    }

    async fn append(&self, list: &str, value: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let entries = inner.lists.entry(list.to_string()).or_default();
        entries.push(value.to_string());
        Ok(u64::try_from(entries.len()).unwrap_or(u64::MAX))
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.lists.get(list).cloned().unwrap_or_default())
    }

    async fn list_trim(&self, list: &str, keep_last: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(entries) = inner.lists.get_mut(list) {
            let keep = usize::try_from(keep_last).unwrap_or(usize::MAX);
            if entries.len() > keep {
                let excess = entries.len() - keep;
                entries.drain(..excess);
            }
        }
        Ok(())
    }
}
