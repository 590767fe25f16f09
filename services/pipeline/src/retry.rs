//! Bounded exponential backoff shared by every component that talks to the
//! network.
//!
//! Policies are configured per dependency (`capture.reconnect`,
//! `inference.retry`, `storage.retry`, ...) and turned into a
//! [`backoff::ExponentialBackoff`] on demand.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy for a single dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first one (0 = unlimited)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter applied to each delay (0.0 disables it)
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_randomization_factor() -> f64 {
    0.5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
        }
    }
}

impl RetryConfig {
    /// Create a policy with the given attempt budget and delay bounds.
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
            ..Default::default()
        }
    }

    /// Same policy with jitter disabled, so delays are exact.
    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    /// Build a fresh backoff schedule. It never gives up on elapsed time;
    /// attempt budgets are enforced by the caller.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    /// Whether `attempts` already used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects,
/// the attempt budget runs out or `cancel` fires. Cancellation only stops new
/// attempts; an attempt already running is always awaited to completion.
pub async fn retry_until_cancelled<T, E, F, Fut, R>(
    policy: &RetryConfig,
    operation: &str,
    is_retryable: R,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if policy.is_exhausted(attempts) || cancel.is_cancelled() || !is_retryable(&error) {
            return Err(error);
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or_else(|| policy.max_backoff());
        warn!(
            operation = %operation,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(operation = %operation, "Shutting down, giving up on retries");
                return Err(error);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
