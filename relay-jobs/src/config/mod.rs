//! Configuration for the resilience layer.
//!
//! Loaded from multiple sources with clear precedence:
//!
//! 1. Environment variables (highest priority, `RELAY_` prefix)
//! 2. A TOML file (`./relay.toml` by default)
//! 3. Hardcoded defaults (fallback)
//!
//! Every knob can also be overridden per job type via `[job_types.<name>]`
//! tables, since a model-training job and a report export rarely want the
//! same retry curve.
//!
//! # Example Configuration
//!
//! ```toml
//! # relay.toml
//! [retry]
//! max_retries = 5
//! base_delay_ms = 500
//! growth_factor = 2.0
//! max_delay_ms = 60000
//! jitter_fraction = 0.2
//!
//! [circuit]
//! failure_threshold = 3
//! reset_timeout_secs = 30
//!
//! [idempotency]
//! ttl_secs = 60
//! release_on_terminal = true
//!
//! [rate_limits.ml-training-backend]
//! max_calls = 10
//! window_secs = 60
//!
//! [job_types.train-model.retry]
//! max_retries = 2
//! base_delay_ms = 5000
//! ```

use std::collections::HashMap;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Retry scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Budget-consuming failures allowed before giving up.
    pub max_retries: u32,

    /// First retry delay, pre-jitter.
    pub base_delay_ms: u64,

    /// Multiplier applied per consumed attempt.
    pub growth_factor: f64,

    /// Upper bound the delay sequence converges to.
    pub max_delay_ms: u64,

    /// Uniform jitter as a fraction of the computed delay (0.0–1.0).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            growth_factor: 2.0,
            max_delay_ms: 60_000,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryConfig {
    /// Base delay as a [`Duration`].
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker knobs, per named resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a probe.
    pub reset_timeout_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
        }
    }
}

impl CircuitConfig {
    /// Reset timeout as a [`Duration`].
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Idempotency guard knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a dedup key stays held if never released.
    pub ttl_secs: u64,

    /// Release the key as soon as the job reaches a terminal outcome
    /// (instead of waiting out the TTL).
    pub release_on_terminal: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            release_on_terminal: true,
        }
    }
}

impl IdempotencyConfig {
    /// TTL as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Rate limit for one named resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls allowed per window.
    pub max_calls: u64,

    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 60,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    /// Window as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-job-type overrides; unset sections inherit the top-level values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTypeOverrides {
    /// Retry overrides for this job type.
    pub retry: Option<RetryConfig>,

    /// Idempotency overrides for this job type.
    pub idempotency: Option<IdempotencyConfig>,

    /// Named downstream resource this job type depends on; selects the
    /// circuit and rate limit applied to it.
    pub resource: Option<String>,
}

/// Complete resilience-layer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Default retry curve.
    pub retry: RetryConfig,

    /// Default circuit breaker settings.
    pub circuit: CircuitConfig,

    /// Default idempotency settings.
    pub idempotency: IdempotencyConfig,

    /// Per-resource rate limits, keyed by resource name.
    pub rate_limits: HashMap<String, RateLimitConfig>,

    /// Per-job-type overrides, keyed by job type name.
    pub job_types: HashMap<String, JobTypeOverrides>,

    /// Redis URL for the shared store (multi-worker deployments).
    pub store_url: Option<String>,
}

impl RelayConfig {
    /// Load configuration from `./relay.toml` plus `RELAY_` env overrides.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if a source is present but malformed.
    pub fn load() -> RelayResult<Self> {
        Self::load_from("relay.toml")
    }

    /// Load configuration from a specific TOML file plus `RELAY_` env
    /// overrides. A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if a source is present but malformed.
    pub fn load_from(path: &str) -> RelayResult<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Effective retry config for a job type.
    #[must_use]
    pub fn retry_for(&self, job_type: &str) -> &RetryConfig {
        self.job_types
            .get(job_type)
            .and_then(|o| o.retry.as_ref())
            .unwrap_or(&self.retry)
    }

    /// Effective idempotency config for a job type.
    #[must_use]
    pub fn idempotency_for(&self, job_type: &str) -> &IdempotencyConfig {
        self.job_types
            .get(job_type)
            .and_then(|o| o.idempotency.as_ref())
            .unwrap_or(&self.idempotency)
    }

    /// Rate limit for a resource, if one is configured.
    #[must_use]
    pub fn rate_limit_for(&self, resource: &str) -> Option<RateLimitConfig> {
        self.rate_limits.get(resource).copied()
    }
}
