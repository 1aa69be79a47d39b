//! Back-off schedules and bounded retry of single calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use rdmsync_common::{Error, Result};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total calls, the first one included.
    pub attempts: u32,
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound of every delay.
    pub cap: Duration,
    /// Growth per failure; 1 keeps the delay fixed.
    pub factor: u32,
}

impl RetryConfig {
    /// Doubling delays starting at `base`, bounded by `cap`.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self {
            attempts: 4,
            base,
            cap,
            factor: 2,
        }
    }

    /// `attempts` calls with the same delay before each retry.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base: delay,
            cap: delay,
            factor: 1,
        }
    }

    /// Delay to sleep after the `n`th failure, counting from 0.
    pub fn delay(&self, n: u32) -> Duration {
        self.base
            .saturating_mul(self.factor.saturating_pow(n))
            .min(self.cap)
    }
}

/// Repeats one call until it succeeds, fails for good, or attempts run out.
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry the errors `retryable` accepts.
    pub async fn run_while<F, Fut, T, C>(&self, op: F, retryable: C) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut failures = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) => e,
            };
            failures += 1;
            if failures >= self.config.attempts {
                warn!("Giving up after {} attempts: {}", failures, err);
                return Err(err);
            }
            let delay = self.config.delay(failures - 1);
            debug!("Attempt {} failed ({}), next in {:?}", failures, err, delay);
            sleep(delay).await;
        }
    }
}
