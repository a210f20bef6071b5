//! Circuit breaker per named downstream resource.
//!
//! Protects a dependency from sustained overload by fast-failing while it is
//! unhealthy. State lives in the shared store and is advanced only through
//! compare-and-swap, so any number of workers can consult and update the
//! same circuit without a read-modify-write race; the breaker is touched
//! only at admission and completion, never held during job execution.
//!
//! State machine per resource:
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN   --(reset_timeout elapsed, one winner)-------> HALF_OPEN (probe)
//! HALF_OPEN --(probe succeeds)--> CLOSED (failures reset to 0)
//! HALF_OPEN --(probe fails)-----> OPEN (opened_at restarts)
//! ```
//!
//! While HALF_OPEN, exactly one probe is in flight; everyone else is
//! rejected until the probe resolves.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::error::{RelayError, RelayResult};
use crate::store::{CasOutcome, SharedStore};

/// How long rejected callers should wait while a probe is unresolved.
const PROBE_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// CAS retry budget; exceeding it means pathological contention, in which
/// case rejecting is the safe answer.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Lifecycle state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls flow through.
    Closed,
    /// Fast-failing; no execution is attempted.
    Open,
    /// One probe call is permitted to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Human-readable state name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Persisted circuit document, one per resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed while closed.
    pub consecutive_failures: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// Whether a half-open probe is currently executing.
    pub probe_in_flight: bool,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Outcome of a circuit admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// The call may proceed. `probe` marks the single half-open test call.
    Proceed {
        /// Whether this call is the half-open probe.
        probe: bool,
    },
    /// The circuit is open (or a probe is unresolved); do not execute.
    Rejected {
        /// Suggested delay before the caller tries again.
        retry_after: Duration,
    },
}

/// Circuit breaker registry over the shared store.
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// Create a breaker registry with the given thresholds.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: CircuitConfig) -> Self {
        Self { store, config }
    }

    fn key(resource: &str) -> String {
        format!("circuit:{resource}")
    }

    /// Check whether a call to `resource` may be attempted.
    ///
    /// Circuits are created lazily: an unknown resource is a closed circuit
    /// and costs no write.
    ///
    /// # Errors
    ///
    /// Returns a store error if circuit state is unreachable.
    pub async fn check(&self, resource: &str) -> RelayResult<CircuitDecision> {
        let key = Self::key(resource);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.get(&key).await? else {
                return Ok(CircuitDecision::Proceed { probe: false });
            };
            let snapshot: CircuitSnapshot = serde_json::from_str(&current.data)?;

            match snapshot.state {
                CircuitState::Closed => {
                    return Ok(CircuitDecision::Proceed { probe: false });
                }
                CircuitState::Open => {
                    let elapsed = snapshot
                        .opened_at
                        .map_or(Duration::ZERO, |at| {
                            Utc::now()
                                .signed_duration_since(at)
                                .to_std()
                                .unwrap_or(Duration::ZERO)
                        });
                    let reset_timeout = self.config.reset_timeout();
                    if elapsed < reset_timeout {
                        return Ok(CircuitDecision::Rejected {
                            retry_after: reset_timeout - elapsed,
                        });
                    }
                    // Reset timeout elapsed: race to become the probe.
                    let next = CircuitSnapshot {
                        state: CircuitState::HalfOpen,
                        probe_in_flight: true,
                        ..snapshot
                    };
                    if self.swap(&key, current.version, &next).await? {
                        info!(
                            resource = resource,
                            "Circuit half-open, probe admitted"
                        );
                        return Ok(CircuitDecision::Proceed { probe: true });
                    }
                    // Another worker won the transition; re-read.
                }
                CircuitState::HalfOpen => {
                    if snapshot.probe_in_flight {
                        return Ok(CircuitDecision::Rejected {
                            retry_after: PROBE_SETTLE_DELAY,
                        });
                    }
                    let next = CircuitSnapshot {
                        probe_in_flight: true,
                        ..snapshot
                    };
                    if self.swap(&key, current.version, &next).await? {
                        return Ok(CircuitDecision::Proceed { probe: true });
                    }
                }
            }
        }

        // Contention exhausted the CAS budget; reject conservatively.
        Ok(CircuitDecision::Rejected {
            retry_after: PROBE_SETTLE_DELAY,
        })
    }

    /// Report the outcome of an executed call.
    ///
    /// Throttled outcomes must not be reported; they are not dependency
    /// failures (the rate limiter runs before the breaker for exactly this
    /// reason).
    ///
    /// # Errors
    ///
    /// Returns a store error if circuit state is unreachable.
    pub async fn report(&self, resource: &str, success: bool) -> RelayResult<()> {
        let key = Self::key(resource);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key).await?;
            let (version, snapshot) = match &current {
                Some(v) => (Some(v.version), serde_json::from_str(&v.data)?),
                None => (None, CircuitSnapshot::default()),
            };

            let next = if success {
                Self::on_success(resource, &snapshot)
            } else {
                self.on_failure(resource, &snapshot)
            };

            // A success on an untouched closed circuit needs no write.
            if version.is_none() && next == snapshot {
                return Ok(());
            }

            let json = serde_json::to_string(&next)?;
            match self.store.compare_and_swap(&key, version, &json).await? {
                CasOutcome::Swapped(_) => return Ok(()),
                CasOutcome::Conflict => {}
            }
        }

        Err(RelayError::Store(crate::store::StoreError::Backend(
            format!("circuit {resource}: CAS budget exhausted"),
        )))
    }

    fn on_success(resource: &str, snapshot: &CircuitSnapshot) -> CircuitSnapshot {
        if snapshot.state != CircuitState::Closed {
            info!(
                resource = resource,
                from = snapshot.state.name(),
                "Circuit closed after successful call"
            );
        }
        CircuitSnapshot::default()
    }

    fn on_failure(&self, resource: &str, snapshot: &CircuitSnapshot) -> CircuitSnapshot {
        match snapshot.state {
            CircuitState::Closed => {
                let failures = snapshot.consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        resource = resource,
                        consecutive_failures = failures,
                        failure_threshold = self.config.failure_threshold,
                        "Circuit opened"
                    );
                    CircuitSnapshot {
                        state: CircuitState::Open,
                        consecutive_failures: failures,
                        opened_at: Some(Utc::now()),
                        probe_in_flight: false,
                    }
                } else {
                    CircuitSnapshot {
                        consecutive_failures: failures,
                        ..snapshot.clone()
                    }
                }
            }
            CircuitState::HalfOpen => {
                warn!(resource = resource, "Probe failed, circuit re-opened");
                CircuitSnapshot {
                    state: CircuitState::Open,
                    consecutive_failures: snapshot.consecutive_failures + 1,
                    opened_at: Some(Utc::now()),
                    probe_in_flight: false,
                }
            }
            // A straggler failure while already open; keep opened_at.
            CircuitState::Open => CircuitSnapshot {
                consecutive_failures: snapshot.consecutive_failures + 1,
                ..snapshot.clone()
            },
        }
    }

    /// Give the half-open probe slot back without judging the dependency.
    ///
    /// A probe that ends in a permanent job failure, a throttle, or a
    /// cancellation says nothing about downstream health. The circuit stays
    /// HALF_OPEN and the next caller may take the probe slot; without this
    /// release the circuit would reject everyone until an operator
    /// intervened.
    ///
    /// # Errors
    ///
    /// Returns a store error if circuit state is unreachable.
    pub async fn release_probe(&self, resource: &str) -> RelayResult<()> {
        let key = Self::key(resource);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.get(&key).await? else {
                return Ok(());
            };
            let snapshot: CircuitSnapshot = serde_json::from_str(&current.data)?;
            if snapshot.state != CircuitState::HalfOpen || !snapshot.probe_in_flight {
                return Ok(());
            }
            let next = CircuitSnapshot {
                probe_in_flight: false,
                ..snapshot
            };
            if self.swap(&key, current.version, &next).await? {
                info!(resource = resource, "Probe abandoned, slot released");
                return Ok(());
            }
        }

        Err(RelayError::Store(crate::store::StoreError::Backend(
            format!("circuit {resource}: CAS budget exhausted"),
        )))
    }

    /// Operator override: force a circuit back to CLOSED.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub async fn force_close(&self, resource: &str) -> RelayResult<()> {
        let json = serde_json::to_string(&CircuitSnapshot::default())?;
        self.store.put(&Self::key(resource), &json, None).await?;
        info!(resource = resource, "Circuit forced closed by operator");
        Ok(())
    }

    /// Read the current snapshot of a circuit (operational surface).
    ///
    /// # Errors
    ///
    /// Returns a store error if circuit state is unreachable.
    pub async fn snapshot(&self, resource: &str) -> RelayResult<CircuitSnapshot> {
        match self.store.get(&Self::key(resource)).await? {
            Some(v) => Ok(serde_json::from_str(&v.data)?),
            None => Ok(CircuitSnapshot::default()),
        }
    }

    async fn swap(
        &self,
        key: &str,
        version: u64,
        next: &CircuitSnapshot,
    ) -> RelayResult<bool> {
        let json = serde_json::to_string(next)?;
        Ok(matches!(
            self.store.compare_and_swap(key, Some(version), &json).await?,
            CasOutcome::Swapped(_)
        ))
    }
}
