// crates/lochness-sync/src/retry.rs
// ============================================================================
// Module: Retry Policy
// Description: Exponential backoff with jitter and cancellable sleeps.
// Purpose: Bound retries of transient connector failures.
// Dependencies: lochness-config, rand, tokio, tokio-util
// ============================================================================

//! ## Overview
//! Delays double from `initial` up to `max`, then a uniform jitter of ±25 %
//! is applied and the result is clamped to `max` again. Sleeping returns early
//! when the run is cancelled.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use lochness_config::SyncConfig;
use rand::Rng;
use tokio_util::sync::CancellationToken;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Jitter span as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.25;

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Backoff schedule for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Delay ceiling.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Builds the policy from orchestrator configuration.
    #[must_use]
    pub const fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Returns true when another attempt is allowed after `attempt` failures.
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Returns the un-jittered delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1_u32 << exponent;
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Returns the jittered delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_FRACTION) ..= (1.0 + JITTER_FRACTION));
        base.mul_f64(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns `false` when the sleep was cut short by cancellation.
pub async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
