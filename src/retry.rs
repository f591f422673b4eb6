//! Bounded backoff for transient store failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Policy for retrying a failed store operation.
///
/// `max_attempts` counts retries after the first try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// No retries - fail immediately.
    None,

    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts.
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Exponential backoff between retries.
    Exponential {
        /// Maximum number of retry attempts.
        max_attempts: u32,
        /// Initial delay (doubles each attempt).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at 100ms, capped at 5 seconds.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Calculate the delay before retry number `attempt` (1-indexed).
    ///
    /// Returns `None` once the attempts are used up.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_attempts, delay } => (attempt <= *max_attempts).then_some(*delay),
            Self::Exponential {
                max_attempts,
                initial_delay,
                max_delay,
            } => {
                if attempt > *max_attempts {
                    return None;
                }
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                let delay = initial_delay.saturating_mul(multiplier);
                Some(delay.min(*max_delay))
            }
        }
    }

    /// Returns the maximum number of retries allowed.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// Each failed attempt that will be retried is logged at `warn`; the last
/// error is returned to the caller untouched.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                let Some(delay) = policy.delay_for_attempt(attempt) else {
                    return Err(e);
                };
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
