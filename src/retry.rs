//! Retry policy shared by health polling, backup verification and
//! notification delivery.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub initial_backoff: Duration,
    /// Backoff multiplier applied after every failed attempt.
    pub multiplier: u32,
    /// Upper bound on a single sleep.
    pub clamp_backoff: Duration,
    /// Scale each sleep by a random factor in 0.9..=1.1.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            multiplier: cfg.multiplier.max(1),
            clamp_backoff: Duration::from_millis(cfg.clamp_backoff_ms),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval polling: `attempts` tries spaced `interval` apart.
    pub fn fixed(interval: Duration, attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_backoff: interval,
            multiplier: 1,
            clamp_backoff: interval,
            jitter: false,
        }
    }

    /// A single attempt, no sleeping.
    pub fn once() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// The (unjittered) sleep that follows failed attempt number `attempt`
    /// (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut backoff = self.initial_backoff;
        for _ in 0..attempt {
            backoff = backoff.saturating_mul(self.multiplier);
            if backoff >= self.clamp_backoff {
                return self.clamp_backoff;
            }
        }
        backoff.min(self.clamp_backoff)
    }

    pub async fn sleep(&self, attempt: u32) {
        let base = self.backoff_for(attempt);
        if base.is_zero() {
            return;
        }
        let sleep = if self.jitter {
            let factor = rand::rng().random_range(0.9..=1.1);
            base.mul_f64(factor)
        } else {
            base
        };
        tokio::time::sleep(sleep).await;
    }

    /// Run `op` until it succeeds or the attempt budget is spent. The closure
    /// receives the zero-based attempt number. Returns the last error.
    pub async fn retry<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.max_attempts => {
                    tracing::warn!(
                        "{label}: attempt {}/{} failed: {e}",
                        attempt + 1,
                        self.max_attempts
                    );
                    self.sleep(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
