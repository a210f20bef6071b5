//! Retry scheduling: capped exponential backoff with uniform jitter.
//!
//! The scheduler is pure decision logic: it computes *whether* to retry and
//! *after how long*, and hands the delay back to the dispatcher. It never
//! sleeps; delayed re-execution is the queue collaborator's job.
//!
//! Throttled outcomes are not failures: they yield a deferred retry without
//! consuming retry budget, so the scheduler only counts attempts that failed
//! with a retryable error.

// Backoff math is float-based by nature; the casts are bounded by max_delay.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ErrorKind;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the job to run after this delay.
    RetryAfter(Duration),
    /// Stop retrying; route the job to the dead-letter store.
    GiveUp,
}

/// Computes backoff delays and retry-budget exhaustion.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    /// Create a scheduler with the given retry curve.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide the next action after a failure.
    ///
    /// `attempt_number` counts budget-consuming failures so far, including
    /// the one just observed. Permanent errors give up immediately without
    /// touching the budget; throttles defer by the base delay (the caller
    /// usually has a better `retry_after` hint from the throttling party and
    /// should prefer it).
    #[must_use]
    pub fn next_action(&self, attempt_number: u32, error_kind: ErrorKind) -> RetryDecision {
        match error_kind {
            ErrorKind::Permanent => RetryDecision::GiveUp,
            ErrorKind::Throttled => {
                RetryDecision::RetryAfter(self.config.base_delay())
            }
            ErrorKind::Retryable => {
                if attempt_number > self.config.max_retries {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::RetryAfter(self.jittered(self.delay_for(attempt_number)))
                }
            }
        }
    }

    /// Pre-jitter delay for the Nth budget-consuming failure (1-based).
    ///
    /// The sequence `base * growth^(n-1)` is non-decreasing and converges to
    /// `max_delay`; growth factors below 1 are treated as 1 so the bound
    /// holds for any configuration.
    #[must_use]
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let base_ms = self.config.base_delay_ms as f64;
        let max_ms = self.config.max_delay_ms as f64;
        let growth = self.config.growth_factor.max(1.0);
        let exponent = attempt_number.saturating_sub(1).min(1_000);
        let raw = base_ms * growth.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(0.0).round() as u64)
    }

    /// Apply uniform jitter: `delay * (1 ± jitter_fraction)`, floored at 1ms
    /// so a jittered delay can never reach zero.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.config.jitter_fraction.clamp(0.0, 1.0);
        if fraction == 0.0 {
            return delay.max(Duration::from_millis(1));
        }
        let delay_ms = delay.as_millis() as f64;
        let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
        let jittered_ms = (delay_ms * factor).round().max(1.0);
        Duration::from_millis(jittered_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheduler(max_retries: u32) -> RetryScheduler {
        RetryScheduler::new(RetryConfig {
            max_retries,
            base_delay_ms: 100,
            growth_factor: 2.0,
            max_delay_ms: 5_000,
            jitter_fraction: 0.2,
        })
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let s = scheduler(10);
        assert_eq!(s.delay_for(1), Duration::from_millis(100));
        assert_eq!(s.delay_for(2), Duration::from_millis(200));
        assert_eq!(s.delay_for(3), Duration::from_millis(400));
        // 100 * 2^9 = 51_200, capped.
        assert_eq!(s.delay_for(10), Duration::from_millis(5_000));
        assert_eq!(s.delay_for(100), Duration::from_millis(5_000));
    }

    #[test]
    fn test_gives_up_past_budget() {
        let s = scheduler(5);
        assert!(matches!(
            s.next_action(5, ErrorKind::Retryable),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(s.next_action(6, ErrorKind::Retryable), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_gives_up_immediately() {
        let s = scheduler(5);
        assert_eq!(s.next_action(1, ErrorKind::Permanent), RetryDecision::GiveUp);
    }

    #[test]
    fn test_throttle_defers_even_past_budget() {
        let s = scheduler(2);
        // Throttles never consume budget, so the decision holds at any count.
        assert!(matches!(
            s.next_action(100, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn test_zero_jitter_floors_at_one_milli() {
        let s = RetryScheduler::new(RetryConfig {
            jitter_fraction: 0.0,
            ..RetryConfig::default()
        });
        assert_eq!(s.jittered(Duration::ZERO), Duration::from_millis(1));
    }

    proptest! {
        #[test]
        fn prop_pre_jitter_delay_is_monotone_and_bounded(
            base_delay_ms in 1_u64..10_000,
            growth_factor in 1.0_f64..8.0,
            max_delay_ms in 1_u64..600_000,
            attempt in 1_u32..64,
        ) {
            let s = RetryScheduler::new(RetryConfig {
                max_retries: 100,
                base_delay_ms,
                growth_factor,
                max_delay_ms,
                jitter_fraction: 0.0,
            });
            let here = s.delay_for(attempt);
            let next = s.delay_for(attempt + 1);
            prop_assert!(next >= here, "delay sequence must be non-decreasing");
            prop_assert!(here <= Duration::from_millis(max_delay_ms));
        }

        #[test]
        fn prop_jitter_stays_in_band_and_positive(
            delay_ms in 1_u64..600_000,
            jitter_fraction in 0.0_f64..=1.0,
        ) {
            let s = RetryScheduler::new(RetryConfig {
                jitter_fraction,
                ..RetryConfig::default()
            });
            let jittered = s.jittered(Duration::from_millis(delay_ms));
            prop_assert!(jittered > Duration::ZERO);
            let delay = delay_ms as f64;
            let low = (delay * (1.0 - jitter_fraction) - 1.0).max(1.0);
            let high = delay * (1.0 + jitter_fraction) + 1.0;
            let got = jittered.as_millis() as f64;
            prop_assert!(got >= low && got <= high);
        }
    }
}
