//! Admission policy: the per-attempt gate workers consult before executing.
//!
//! Composes the rate limiter and circuit breaker for the resource a job type
//! depends on, in that order. Order matters: a throttle is a deliberate
//! bound, not a dependency failure, so it must be decided before the breaker
//! is consulted and must never feed the breaker's failure counters.
//!
//! The idempotency guard is not part of this gate. Dedup keys are resolved
//! once at submission; re-checking them per attempt would let a retry of the
//! owning job collide with its own lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::circuit::{CircuitBreaker, CircuitDecision};
use crate::error::{ErrorKind, RelayResult};
use crate::rate_limit::{RateDecision, RateLimiter};

/// Why an attempt was deferred without executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The resource's rate window is exhausted.
    RateLimited,
    /// The resource's circuit is open or a probe is unresolved.
    CircuitOpen,
}

impl DeferReason {
    /// Human-readable reason name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// Outcome of the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Execute now. `probe` marks the single half-open test call.
    Execute {
        /// Whether this execution is the circuit's half-open probe.
        probe: bool,
    },
    /// Do not execute; re-enqueue after `retry_after`. Deferral consumes no
    /// retry budget.
    Defer {
        /// How long to wait before the next admission check.
        retry_after: Duration,
        /// Which gate deferred the attempt.
        reason: DeferReason,
    },
}

/// The composed pre-execution gate.
pub struct AdmissionPolicy {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl AdmissionPolicy {
    /// Compose a policy from the shared limiter and breaker.
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { limiter, breaker }
    }

    /// The circuit breaker behind this policy (operational surface).
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Decide whether an attempt against `resource` may execute right now.
    ///
    /// Jobs with no declared resource are always admitted; they have nothing
    /// to protect.
    ///
    /// # Errors
    ///
    /// Returns a store error if shared gate state is unreachable.
    pub async fn admit(&self, resource: Option<&str>) -> RelayResult<Admission> {
        let Some(resource) = resource else {
            return Ok(Admission::Execute { probe: false });
        };

        if let RateDecision::Throttled { retry_after } = self.limiter.allow(resource).await? {
            debug!(
                resource = resource,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "Attempt deferred by rate limit"
            );
            return Ok(Admission::Defer {
                retry_after,
                reason: DeferReason::RateLimited,
            });
        }

        match self.breaker.check(resource).await? {
            CircuitDecision::Proceed { probe } => Ok(Admission::Execute { probe }),
            CircuitDecision::Rejected { retry_after } => {
                debug!(
                    resource = resource,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Attempt deferred by open circuit"
                );
                Ok(Admission::Defer {
                    retry_after,
                    reason: DeferReason::CircuitOpen,
                })
            }
        }
    }

    /// Feed an executed attempt's outcome back into the circuit.
    ///
    /// Only genuine dependency health flows in: success closes and resets,
    /// a retryable failure counts against the threshold. Permanent failures
    /// are the job's own logic being wrong and throttles are deliberate
    /// bounds; neither says anything about the dependency. When such an
    /// outcome ends a half-open probe, the probe slot is handed back so the
    /// next caller can test the dependency instead.
    ///
    /// # Errors
    ///
    /// Returns a store error if circuit state is unreachable.
    pub async fn observe(
        &self,
        resource: Option<&str>,
        probe: bool,
        outcome: Option<ErrorKind>,
    ) -> RelayResult<()> {
        let Some(resource) = resource else {
            return Ok(());
        };
        match outcome {
            None => self.breaker.report(resource, true).await,
            Some(ErrorKind::Retryable) => self.breaker.report(resource, false).await,
            Some(ErrorKind::Permanent | ErrorKind::Throttled) => {
                if probe {
                    self.breaker.release_probe(resource).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Hand back an admitted probe slot that will never produce an outcome.
    ///
    /// Covers cancellation mid-flight: the attempt was admitted as the
    /// probe, but nothing will be reported for it.
    ///
    /// # Errors
    ///
    /// Returns a store error if circuit state is unreachable.
    pub async fn abandon(&self, resource: Option<&str>, probe: bool) -> RelayResult<()> {
        match resource {
            Some(resource) if probe => self.breaker.release_probe(resource).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::circuit::CircuitState;
    use crate::config::{CircuitConfig, RateLimitConfig};
    use crate::store::memory::MemoryStore;

    fn policy(max_calls: u64, failure_threshold: u32) -> AdmissionPolicy {
        let store: Arc<dyn crate::store::SharedStore> = Arc::new(MemoryStore::new());
        let mut limits = HashMap::new();
        limits.insert(
            "backend-a".to_string(),
            RateLimitConfig {
                max_calls,
                window_secs: 60,
            },
        );
        AdmissionPolicy::new(
            Arc::new(RateLimiter::new(Arc::clone(&store), limits)),
            Arc::new(CircuitBreaker::new(
                store,
                CircuitConfig {
                    failure_threshold,
                    reset_timeout_secs: 60,
                },
            )),
        )
    }

    fn instant_reset_policy(failure_threshold: u32) -> AdmissionPolicy {
        let store: Arc<dyn crate::store::SharedStore> = Arc::new(MemoryStore::new());
        AdmissionPolicy::new(
            Arc::new(RateLimiter::new(Arc::clone(&store), HashMap::new())),
            Arc::new(CircuitBreaker::new(
                store,
                CircuitConfig {
                    failure_threshold,
                    reset_timeout_secs: 0,
                },
            )),
        )
    }

    #[tokio::test]
    async fn test_resourceless_jobs_are_always_admitted() {
        let policy = policy(1, 1);
        for _ in 0..10 {
            assert_eq!(
                policy.admit(None).await.unwrap(),
                Admission::Execute { probe: false }
            );
        }
    }

    #[tokio::test]
    async fn test_rate_limit_defers_before_circuit() {
        let policy = policy(2, 3);
        for _ in 0..2 {
            assert_eq!(
                policy.admit(Some("backend-a")).await.unwrap(),
                Admission::Execute { probe: false }
            );
        }
        assert!(matches!(
            policy.admit(Some("backend-a")).await.unwrap(),
            Admission::Defer {
                reason: DeferReason::RateLimited,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_defers() {
        let policy = policy(100, 2);
        policy
            .observe(Some("backend-a"), false, Some(ErrorKind::Retryable))
            .await
            .unwrap();
        policy
            .observe(Some("backend-a"), false, Some(ErrorKind::Retryable))
            .await
            .unwrap();
        assert!(matches!(
            policy.admit(Some("backend-a")).await.unwrap(),
            Admission::Defer {
                reason: DeferReason::CircuitOpen,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_throttled_outcomes_do_not_trip_circuit() {
        let policy = policy(100, 1);
        for _ in 0..5 {
            policy
                .observe(Some("backend-a"), false, Some(ErrorKind::Throttled))
                .await
                .unwrap();
        }
        assert_eq!(
            policy.breaker().snapshot("backend-a").await.unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_permanent_outcomes_do_not_trip_circuit() {
        let policy = policy(100, 1);
        for _ in 0..5 {
            policy
                .observe(Some("backend-a"), false, Some(ErrorKind::Permanent))
                .await
                .unwrap();
        }
        assert_eq!(
            policy.breaker().snapshot("backend-a").await.unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_success_is_reported_to_circuit() {
        let policy = policy(100, 2);
        policy
            .observe(Some("backend-a"), false, Some(ErrorKind::Retryable))
            .await
            .unwrap();
        policy.observe(Some("backend-a"), false, None).await.unwrap();
        let snapshot = policy.breaker().snapshot("backend-a").await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_permanent_probe_outcome_frees_the_probe_slot() {
        let policy = instant_reset_policy(1);
        policy
            .observe(Some("backend-a"), false, Some(ErrorKind::Retryable))
            .await
            .unwrap();

        // The probe's body turned out to be broken; the dependency was
        // never judged and the slot must come back.
        assert_eq!(
            policy.admit(Some("backend-a")).await.unwrap(),
            Admission::Execute { probe: true }
        );
        policy
            .observe(Some("backend-a"), true, Some(ErrorKind::Permanent))
            .await
            .unwrap();

        assert_eq!(
            policy.admit(Some("backend-a")).await.unwrap(),
            Admission::Execute { probe: true }
        );
    }

    #[tokio::test]
    async fn test_abandoned_probe_frees_the_probe_slot() {
        let policy = instant_reset_policy(1);
        policy
            .observe(Some("backend-a"), false, Some(ErrorKind::Retryable))
            .await
            .unwrap();

        assert_eq!(
            policy.admit(Some("backend-a")).await.unwrap(),
            Admission::Execute { probe: true }
        );
        policy.abandon(Some("backend-a"), true).await.unwrap();

        assert_eq!(
            policy.admit(Some("backend-a")).await.unwrap(),
            Admission::Execute { probe: true }
        );
    }

    #[tokio::test]
    async fn test_abandon_without_probe_is_noop() {
        let policy = instant_reset_policy(3);
        policy.abandon(Some("backend-a"), false).await.unwrap();
        policy.abandon(None, true).await.unwrap();
        assert_eq!(
            policy.breaker().snapshot("backend-a").await.unwrap().state,
            CircuitState::Closed
        );
    }
}
