//! Adaptive lease sizing.
//!
//! Shard preparation is a fixed cost paid once per lease. When it eats a large
//! share of the lease window the next lease doubles; when it is negligible the
//! next lease halves so a crashed worker's shard becomes reclaimable sooner.
//! The decrease bound is tighter than the increase bound, so ratios in between
//! leave the exponent alone and the controller leans towards longer leases.

use std::time::Duration;

/// Below this prep/lease ratio the next lease halves.
pub const DECREASE_THRESHOLD: f64 = 0.025;
/// Above this prep/lease ratio the next lease doubles.
pub const INCREASE_THRESHOLD: f64 = 0.1;

/// Lease exponents beyond this are clamped to keep `base * 2^exponent` finite.
pub const MAX_EXPONENT: u32 = 30;

/// Exponent for the next claim of an item, given how the lease just used went.
pub fn next_exponent(
    existing_exponent: u32,
    lease_duration: Duration,
    shard_prep_time: Duration,
) -> u32 {
    if existing_exponent == 0 {
        return 0;
    }
    let ratio = prep_ratio(lease_duration, shard_prep_time);
    if ratio < DECREASE_THRESHOLD {
        existing_exponent - 1
    } else if ratio > INCREASE_THRESHOLD {
        (existing_exponent + 1).min(MAX_EXPONENT)
    } else {
        existing_exponent
    }
}

/// Shard preparation time as a fraction of the lease window.
pub fn prep_ratio(lease_duration: Duration, shard_prep_time: Duration) -> f64 {
    if lease_duration.is_zero() {
        // Prep cannot fit in an empty lease at all
        return if shard_prep_time.is_zero() {
            0.0
        } else {
            f64::INFINITY
        };
    }
    shard_prep_time.as_secs_f64() / lease_duration.as_secs_f64()
}

/// Lease length for `exponent`: `base * 2^exponent`, saturating.
pub fn lease_duration(base: Duration, exponent: u32) -> Duration {
    let factor = 1u32.checked_shl(exponent.min(MAX_EXPONENT)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

/// Timing of one lease attempt, consumed once when the attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItemTimeSample {
    pub lease_acquisition_ms: i64,
    /// When document streaming began, i.e. after shard preparation.
    pub migration_start_ms: Option<i64>,
}

impl WorkItemTimeSample {
    pub fn new(lease_acquisition_ms: i64) -> Self {
        Self {
            lease_acquisition_ms,
            migration_start_ms: None,
        }
    }

    pub fn record_migration_start(&mut self, now_ms: i64) {
        self.migration_start_ms = Some(now_ms);
    }

    /// None until streaming has started.
    pub fn shard_prep_time(&self) -> Option<Duration> {
        let start = self.migration_start_ms?;
        let elapsed = start.saturating_sub(self.lease_acquisition_ms).max(0);
        Some(Duration::from_millis(elapsed as u64))
    }
}
