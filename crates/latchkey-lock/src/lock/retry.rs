//! Retry-until-acquired on top of any fail-fast lock manager

use std::time::Duration;

use async_trait::async_trait;
use latchkey_common::Result;
use rand::Rng;
use tracing::trace;

use super::service::LockManager;

/// Backoff schedule for contended acquires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 behave as 1
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Randomize each delay within its upper half
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first contended attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let exp = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);

        if !self.jitter || exp.is_zero() {
            return exp;
        }

        let upper = exp.as_nanos() as u64;
        let nanos = rand::rng().random_range(upper / 2..=upper);
        Duration::from_nanos(nanos)
    }
}

/// Wraps a manager so `acquire` retries on contention with backoff.
///
/// Only `LockAlreadyTaken` is retried; every other error is returned as is.
/// `release` is passed straight through.
#[derive(Debug, Clone)]
pub struct RetryingLockManager<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M> RetryingLockManager<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<M> LockManager for RetryingLockManager<M>
where
    M: LockManager,
{
    async fn acquire(&self, key: &str, ttl: Duration, token: Option<&str>) -> Result<String> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.inner.acquire(key, ttl, token).await {
                Err(err) if err.is_contention() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    trace!(key, attempt, delay_ms = delay.as_millis() as u64, "Lock contended, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        self.inner.release(key, token).await
    }
}
