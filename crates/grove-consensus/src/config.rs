//! Engine configuration and the storage retry policy.

use std::future::Future;
use std::time::Duration;

/// Configuration for a group's consensus engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Round timeout for round 0.
    pub base_timeout: Duration,

    /// Maximum exponent of the timeout backoff (`base * 2^min(round, cap)`).
    pub timeout_backoff_cap: u32,

    /// Maximum transactions per proposed block.
    pub max_trxs_per_block: usize,

    /// Capacity of the engine's command mailbox.
    pub mailbox_size: usize,

    /// Maximum number of buffered messages for later heights or rounds.
    pub future_buffer_limit: usize,

    /// Number of committed transaction ids remembered for deduplication.
    pub committed_memory: usize,

    /// Capacity of the commit notification channel.
    pub commit_channel_size: usize,

    /// Retry policy for block appends.
    pub storage_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_millis(2000),
            timeout_backoff_cap: 5,
            max_trxs_per_block: 500,
            mailbox_size: 1024,
            future_buffer_limit: 512,
            committed_memory: 65_536,
            commit_channel_size: 256,
            storage_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Round deadline duration for the given round.
    pub fn timeout_for_round(&self, round: u64) -> Duration {
        let exponent = round.min(self.timeout_backoff_cap as u64) as u32;
        self.base_timeout
            .saturating_mul(2u32.saturating_pow(exponent))
    }
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_delay_ms * self.multiplier.powi(attempt as i32 - 1);
        let capped = Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64);

        if self.jitter {
            let jitter_factor = 1.0 + (rand::random::<f64>() * 0.25);
            Duration::from_millis((capped.as_millis() as f64 * jitter_factor) as u64)
        } else {
            capped
        }
    }

    /// Runs `operation` until it succeeds or the attempts are exhausted.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt >= self.max_attempts.max(1) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Retry exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_timeout_backoff_is_capped() {
        let config = EngineConfig {
            base_timeout: Duration::from_millis(100),
            timeout_backoff_cap: 3,
            ..Default::default()
        };
        assert_eq!(config.timeout_for_round(0), Duration::from_millis(100));
        assert_eq!(config.timeout_for_round(1), Duration::from_millis(200));
        assert_eq!(config.timeout_for_round(3), Duration::from_millis(800));
        assert_eq!(config.timeout_for_round(40), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_growth() {
        let policy = RetryPolicy {
            jitter: false,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(35),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_until_success() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("attempt {} failed", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_gives_up() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
