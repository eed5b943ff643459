//! Backoff decision function.
//!
//! [`ReconnectPolicy`] is pure: given an attempt count it returns the delay
//! before the next attempt. It never sleeps and never reads a clock; callers
//! pass `now` in. This keeps it testable without real time passing.
//!
//! # Algorithm
//!
//! 1. `attempt_count == 0` waits nothing
//! 2. Otherwise the raw delay is `base * 2^(attempt_count - 1)`, capped at `ceiling`
//! 3. A per-device jitter factor shortens every delay by the same fraction
//!
//! Because the jitter factor is fixed per seed (not per attempt), the delay
//! stays non-decreasing in `attempt_count` and never exceeds the ceiling,
//! while a fleet of devices seeded differently still spreads its retries.
//!
//! # Example
//!
//! ```
//! use secure_channel_esp32::reconnect::ReconnectPolicy;
//! use std::time::Duration;
//!
//! let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0, 7);
//! assert_eq!(policy.next_delay(0), Duration::ZERO);
//! assert_eq!(policy.next_delay(1), Duration::from_secs(1));
//! assert_eq!(policy.next_delay(3), Duration::from_secs(4));
//! assert_eq!(policy.next_delay(30), Duration::from_secs(60));
//! ```

use crate::config::{ChannelConfig, MAX_JITTER_PERMILLE};
use rand_core::{OsRng, RngCore};
use std::time::Duration;
use tokio::time::Instant;

/// Doubling stops here; `2^32` times any sane base is past any ceiling.
const MAX_SHIFT: u32 = 32;

/// Exponential backoff with a fixed per-device jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    ceiling: Duration,
    /// Effective jitter for this device, in permille.
    jitter_permille: u16,
}

impl ReconnectPolicy {
    /// Create a policy.
    ///
    /// `max_jitter_permille` bounds the jitter; the effective value is derived
    /// deterministically from `seed`.
    pub fn new(base: Duration, ceiling: Duration, max_jitter_permille: u16, seed: u64) -> Self {
        let max_jitter = u64::from(max_jitter_permille.min(MAX_JITTER_PERMILLE));
        let jitter_permille = (mix(seed) % (max_jitter + 1)) as u16;
        Self {
            base,
            ceiling: ceiling.max(base),
            jitter_permille,
        }
    }

    /// Create a policy from channel tuning.
    pub fn from_config(config: &ChannelConfig, seed: u64) -> Self {
        Self::new(
            config.backoff_base,
            config.backoff_ceiling,
            config.jitter_permille,
            seed,
        )
    }

    /// Seed from the OS (hardware RNG on ESP32).
    pub fn random_seed() -> u64 {
        OsRng.next_u64()
    }

    /// Delay before the next attempt after `attempt_count` consecutive failures.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }

        let shift = (attempt_count - 1).min(MAX_SHIFT);
        let base_ms = self.base.as_millis();
        let ceiling_ms = self.ceiling.as_millis();
        let raw_ms = base_ms.saturating_mul(1u128 << shift).min(ceiling_ms);
        let jittered_ms = raw_ms * u128::from(1000 - self.jitter_permille) / 1000;

        Duration::from_millis(jittered_ms as u64)
    }

    /// Record a failure: bumps the attempt count and sets the next eligible time.
    ///
    /// Returns the delay applied.
    pub fn on_failure(&self, retry: &mut RetryState, now: Instant) -> Duration {
        retry.attempt_count = retry.attempt_count.saturating_add(1);
        let delay = self.next_delay(retry.attempt_count);
        retry.next_eligible = Some(now + delay);
        delay
    }

    /// Record the loss of a live session.
    ///
    /// `recent_closures` counts closures (this one included) within the
    /// stable window. The first closure after a stable session reconnects
    /// immediately; a flapping endpoint backs off like any other failure.
    /// The attempt count never falls below the closure exponent, so a
    /// connect failure that follows cannot shorten the delay.
    pub fn on_session_closed(
        &self,
        retry: &mut RetryState,
        recent_closures: usize,
        now: Instant,
    ) -> Duration {
        let prior = u32::try_from(recent_closures.saturating_sub(1)).unwrap_or(u32::MAX);
        retry.attempt_count = retry.attempt_count.saturating_add(1).max(prior);
        let delay = self.next_delay(prior);
        retry.next_eligible = Some(now + delay);
        delay
    }

    /// Record a successful full connect.
    pub fn on_success(&self, retry: &mut RetryState) {
        retry.attempt_count = 0;
        retry.next_eligible = None;
    }

    /// First retry delay.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay ceiling.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Effective jitter for this device, in permille.
    pub fn jitter_permille(&self) -> u16 {
        self.jitter_permille
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default(), Self::random_seed())
    }
}

/// Retry bookkeeping. Only [`ReconnectPolicy`] mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt_count: u32,
    next_eligible: Option<Instant>,
}

impl RetryState {
    /// Fresh state: no failures, eligible immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures since the last success.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Earliest time the next attempt may start (`None` = now).
    pub fn next_eligible_time(&self) -> Option<Instant> {
        self.next_eligible
    }

    /// Returns true if an attempt may start at `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_eligible.map_or(true, |at| now >= at)
    }
}

/// SplitMix64 finalizer. Spreads nearby seeds (e.g. sequential MACs).
fn mix(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
