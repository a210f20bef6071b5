//! Per-resource rate limiting.
//!
//! Bounds the call rate of a named downstream resource with a fixed-window
//! counter held in the shared store, so the limit is enforced across the
//! whole worker fleet. A throttled decision carries the time until the
//! window resets and is *not* an error: it never feeds the circuit breaker's
//! failure counters and never consumes retry budget.
//!
//! The limiter is evaluated before the breaker for exactly that reason:
//! throttling must not look like a dependency failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::RelayResult;
use crate::store::SharedStore;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The call may proceed.
    Allowed,
    /// The window is exhausted; defer by `retry_after`.
    Throttled {
        /// Time until the current window resets.
        retry_after: Duration,
    },
}

/// Fixed-window rate limiter over the shared store.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    limits: HashMap<String, RateLimitConfig>,
}

impl RateLimiter {
    /// Create a limiter with per-resource limits.
    ///
    /// Resources with no configured limit are never throttled.
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        limits: HashMap<String, RateLimitConfig>,
    ) -> Self {
        Self { store, limits }
    }

    /// Check whether a call to `resource` may proceed right now.
    ///
    /// Counts the call against the current window; a throttled caller's
    /// increment is intentional (the attempt to call is what the limit
    /// bounds).
    ///
    /// # Errors
    ///
    /// Returns a store error if the shared counter is unreachable.
    pub async fn allow(&self, resource: &str) -> RelayResult<RateDecision> {
        let Some(limit) = self.limits.get(resource) else {
            return Ok(RateDecision::Allowed);
        };

        let counted = self
            .store
            .incr_window(&format!("rate:{resource}"), limit.window())
            .await?;

        if counted.count > limit.max_calls {
            debug!(
                resource = resource,
                count = counted.count,
                max_calls = limit.max_calls,
                retry_after_ms = u64::try_from(counted.resets_in.as_millis()).unwrap_or(u64::MAX),
                "Rate limit exceeded"
            );
            Ok(RateDecision::Throttled {
                retry_after: counted.resets_in,
            })
        } else {
            Ok(RateDecision::Allowed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn limiter(max_calls: u64, window_secs: u64) -> RateLimiter {
        let mut limits = HashMap::new();
        limits.insert(
            "backend-a".to_string(),
            RateLimitConfig {
                max_calls,
                window_secs,
            },
        );
        RateLimiter::new(Arc::new(MemoryStore::new()), limits)
    }

    #[tokio::test]
    async fn test_eleventh_call_in_window_is_throttled() {
        let limiter = limiter(10, 60);
        for _ in 0..10 {
            assert_eq!(
                limiter.allow("backend-a").await.unwrap(),
                RateDecision::Allowed
            );
        }
        match limiter.allow("backend-a").await.unwrap() {
            RateDecision::Throttled { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            RateDecision::Allowed => panic!("11th call should be throttled"),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_resource_is_unlimited() {
        let limiter = limiter(1, 60);
        for _ in 0..100 {
            assert_eq!(
                limiter.allow("unmetered").await.unwrap(),
                RateDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn test_resources_are_throttled_independently() {
        let mut limits = HashMap::new();
        limits.insert(
            "backend-a".to_string(),
            RateLimitConfig {
                max_calls: 1,
                window_secs: 60,
            },
        );
        limits.insert(
            "backend-b".to_string(),
            RateLimitConfig {
                max_calls: 5,
                window_secs: 60,
            },
        );
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), limits);

        assert_eq!(
            limiter.allow("backend-a").await.unwrap(),
            RateDecision::Allowed
        );
        assert!(matches!(
            limiter.allow("backend-a").await.unwrap(),
            RateDecision::Throttled { .. }
        ));
        // backend-b has its own window.
        assert_eq!(
            limiter.allow("backend-b").await.unwrap(),
            RateDecision::Allowed
        );
    }
}
