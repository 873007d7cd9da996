//! Exponential backoff with jitter for failed deliveries.
//!
//! `delay(n) = min(base * 2^(n-1), cap)`, then perturbed uniformly within
//! `±jitter_fraction` of itself. `n` is the attempt count after the failed
//! attempt, so the first retry waits roughly `base`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::DeliveryConfig;

/// Largest doubling exponent; beyond this every realistic base hits the cap.
const MAX_EXPONENT: u32 = 30;

/// Retry policy for outbound deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts (including the first) before a retryable failure dead-letters.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub cap_delay: Duration,
    /// Jitter fraction in `[0, 1)`.
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            cap_delay: config.cap_delay(),
            jitter_fraction: config.jitter_fraction,
        }
    }

    /// Whether an attempt count has used up the budget.
    pub fn is_exhausted(&self, retry_count: i64) -> bool {
        retry_count >= i64::from(self.max_attempts)
    }

    /// Un-jittered delay after `retry_count` attempts; non-decreasing in the count.
    pub fn base_backoff(&self, retry_count: i64) -> Duration {
        let exponent = u32::try_from(retry_count.saturating_sub(1).max(0))
            .unwrap_or(MAX_EXPONENT)
            .min(MAX_EXPONENT);
        let multiplier = 2_u32.pow(exponent);

        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.cap_delay, |delay| delay.min(self.cap_delay))
    }

    /// Jittered delay using the supplied random source.
    pub fn backoff_delay_with<R: Rng + ?Sized>(&self, retry_count: i64, rng: &mut R) -> Duration {
        let delay = self.base_backoff(retry_count);
        apply_jitter(delay, self.jitter_fraction, rng)
    }

    /// When the next attempt becomes due.
    pub fn next_retry_at_with<R: Rng + ?Sized>(
        &self,
        last_attempt_at: DateTime<Utc>,
        retry_count: i64,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let delay = self.backoff_delay_with(retry_count, rng);
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        chrono::Duration::try_milliseconds(millis)
            .and_then(|delta| last_attempt_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Randomizes the delay by ±jitter_fraction of itself.
fn apply_jitter<R: Rng + ?Sized>(duration: Duration, jitter_fraction: f64, rng: &mut R) -> Duration {
    if jitter_fraction <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_fraction.min(1.0);
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}
