//! Bounded retry with full-jitter exponential backoff
//!
//! Used by outbox delivery, the CAS resolver's HTTPS path, and permit
//! acquisition. The combinator takes a fallible async operation plus a
//! should-retry predicate and a bounded attempt count.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};

/// Compute exponential backoff with jitter.
/// Uses full-jitter strategy: sleep = random(0, min(cap, base * 2^attempt))
pub fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp_ms = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = exp_ms.min(max.as_millis() as u64);
    if capped_ms == 0 {
        return Duration::ZERO;
    }

    let jitter_ms = rand::thread_rng().gen_range(0..=capped_ms);
    Duration::from_millis(jitter_ms)
}

/// Retry policy for [`with_retries`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Run `op` until it succeeds, the predicate declines the error, or the
/// attempt budget runs out. The last error is returned on exhaustion.
pub async fn with_retries<T, F, Fut, P>(policy: &RetryPolicy, should_retry: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;

                if attempt >= policy.max_attempts || !should_retry(&e) {
                    return Err(e);
                }

                let delay = backoff_with_jitter(attempt - 1, policy.base_delay, policy.max_delay);
                debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, error = %e,
                    "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
