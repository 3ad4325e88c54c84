use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Backoff policy for transient coordination-store failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryPolicy::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "RetryPolicy::default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub randomize: bool,
}

impl RetryPolicy {
    pub fn default_max_attempts() -> u32 {
        5
    }
    pub fn default_initial_backoff_ms() -> u64 {
        100
    }
    pub fn default_max_backoff_ms() -> u64 {
        5_000
    }
    pub fn default_backoff_factor() -> f64 {
        2.0
    }

    /// No waiting between tries; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_factor: 1.0,
            randomize: false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            backoff_factor: Self::default_backoff_factor(),
            randomize: false,
        }
    }
}

/// Delay before the next try, or None once the policy is exhausted.
/// - `failures_so_far`: failed tries so far (1 after the first failure)
///
/// delay_n = initial * factor^(n-1), capped at `max_backoff_ms`. With
/// `randomize` the delay is scaled by a uniform factor in [1.0, 2.0) before capping.
pub fn next_backoff(failures_so_far: u32, policy: &RetryPolicy) -> Option<Duration> {
    if failures_so_far == 0 || failures_so_far >= policy.max_attempts {
        return None;
    }
    let exponent = i32::try_from(failures_so_far - 1).unwrap_or(i32::MAX);
    let mut delay = policy.initial_backoff_ms as f64 * policy.backoff_factor.powi(exponent);
    if policy.randomize {
        delay *= 1.0 + rand::random::<f64>();
    }
    let capped = delay.min(policy.max_backoff_ms as f64).max(0.0);
    Some(Duration::from_millis(capped.round() as u64))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy
/// runs out of tries. The last error is returned on exhaustion.
pub async fn retry_transient<T, E, F, Fut>(
    op_name: &str,
    policy: &RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                failures += 1;
                let Some(delay) = next_backoff(failures, policy) else {
                    return Err(e);
                };
                debug!(
                    op = op_name,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
