//! Bounded retry with exponential backoff for provider calls inside a tick.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::github::GitHubError;
use crate::shutdown::Shutdown;

/// Upper bound on a single backoff sleep.
pub const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub const fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    /// Delay before retry number `attempt` (1-based), with ±25% jitter,
    /// capped at [`MAX_DELAY`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter = rand::rng().random_range(0.75..=1.25);
        Duration::try_from_secs_f64(exp.as_secs_f64() * jitter)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }
}

/// Errors GitHub told us are permanent are not worth a second try.
fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|e| e.downcast_ref::<GitHubError>())
        .is_none_or(GitHubError::is_transient)
}

/// Run `op` up to `policy.max_attempts` times.
///
/// Gives up early on a permanent GitHub error or when `shutdown` fires during
/// a backoff sleep. The last error is returned.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    what: &str,
    mut op: impl FnMut() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts || !is_retryable(&e) => return Err(e),
            Err(e) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %format!("{e:#}"),
                    "retrying"
                );
                if shutdown.wait(delay) {
                    return Err(e.context("shutdown requested during retry"));
                }
                attempt += 1;
            }
        }
    }
}
