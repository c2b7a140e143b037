//! Provider-call retry with jittered exponential back-off.
//!
//! Generalizes the node transport's reconnect policy to provider calls:
//! the same shape (base delay, factor, cap, bounded attempts, jitter) but
//! applied around a single request/response instead of a long-lived
//! connection.

use arena_domain::config::RetryConfig;
use arena_domain::{ArenaError, Result};
use std::time::Duration;

/// Computes per-attempt delays from a [`RetryConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    max_attempts: u32,
    jitter_fraction: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_factor: cfg.backoff_factor,
            max_attempts: cfg.max_attempts,
            jitter_fraction: cfg.jitter_fraction,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt number (0-indexed, 0 = first retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        let jitter = capped_ms * self.jitter_fraction * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Run `f` up to `max_attempts` times, sleeping between attempts
    /// according to the backoff schedule. Stops immediately on a
    /// non-retryable error.
    pub async fn retry<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.retryable() && !self.should_give_up(attempt) => {
                    tracing::warn!(attempt, error = %e, "provider call failed, retrying");
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread retry storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761);
    (hash as f64) / (u32::MAX as f64)
}
