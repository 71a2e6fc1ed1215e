//! `latchkey demo`: one key through its whole lifecycle

use std::fmt;
use std::time::Duration;

use anyhow::{bail, ensure};
use clap::Args;
use latchkey_lock::{LockError, LockManager};
use tracing::info;

#[derive(Debug, Clone, Args)]
pub struct DemoArgs {
    /// Key to lock
    #[arg(long, default_value = "job-1")]
    pub key: String,
    /// Lock TTL in milliseconds
    #[arg(long = "ttl-ms", default_value_t = 100)]
    pub ttl_ms: u64,
    /// How long to wait for the lock to lapse, as a multiple of the TTL
    #[arg(long = "expiry-factor", default_value_t = 1.5)]
    pub expiry_factor: f64,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            key: "job-1".to_string(),
            ttl_ms: 100,
            expiry_factor: 1.5,
        }
    }
}

/// Tokens observed while walking the key through its lifecycle
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub key: String,
    pub first_token: String,
    pub second_token: String,
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "key:           {}", self.key)?;
        writeln!(f, "first holder:  {}", self.first_token)?;
        write!(f, "second holder: {}", self.second_token)
    }
}

/// Acquire, contend, renew, let the lock lapse, re-acquire and release.
///
/// Every step checks the outcome the lock contract promises and fails the
/// command if the manager behaves otherwise.
pub async fn run_demo(manager: &dyn LockManager, args: &DemoArgs) -> anyhow::Result<DemoReport> {
    ensure!(args.expiry_factor > 1.0, "expiry factor must be greater than 1");
    let key = args.key.as_str();
    let ttl = Duration::from_millis(args.ttl_ms);

    let first = manager.acquire(key, ttl, None).await?;
    info!(key, token = %first, ttl_ms = args.ttl_ms, "Acquired lock");

    match manager.acquire(key, ttl, Some("intruder")).await {
        Err(LockError::LockAlreadyTaken { .. }) => {
            info!(key, "Second holder rejected while the lock is live");
        }
        Ok(token) => bail!("lock on '{}' was granted twice (token {})", key, token),
        Err(e) => return Err(e.into()),
    }

    match manager.release(key, "intruder").await {
        Err(LockError::UnlockNotPermitted { .. }) => {
            info!(key, "Release with a foreign token refused");
        }
        Ok(()) => bail!("lock on '{}' was released with a foreign token", key),
        Err(e) => return Err(e.into()),
    }

    let renewed = manager.acquire(key, ttl, Some(first.as_str())).await?;
    ensure!(renewed == first, "renewal returned a different token");
    info!(key, "Holder renewed its lock");

    tokio::time::sleep(ttl.mul_f64(args.expiry_factor)).await;

    let second = manager.acquire(key, ttl, None).await?;
    ensure!(second != first, "expired lock was re-granted with the same token");
    info!(key, token = %second, "Acquired lock after expiry");

    manager.release(key, &second).await?;
    manager.release(key, &second).await?;
    info!(key, "Released lock; repeated release was a no-op");

    // The lock is free again, so a fresh acquire must succeed
    let third = manager.acquire(key, ttl, None).await?;
    manager.release(key, &third).await?;

    Ok(DemoReport {
        key: args.key.clone(),
        first_token: first,
        second_token: second,
    })
}
