//! Keep-alive for held locks
//!
//! Renews a lock at a third of its TTL by re-acquiring it with the owning
//! token, which every `LockManager` treats as a renewal.

use std::sync::Arc;
use std::time::Duration;

use latchkey_common::{LockError, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use super::service::LockManager;

/// Background renewal of one held lock
///
/// Renewal stops when [`stop`](Self::stop) is called, when the handle is
/// dropped, or after the first failed renewal.
pub struct AutoRenewal {
    key: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl AutoRenewal {
    /// Start renewing `key` held under `token` every `ttl / 3`.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<M>(
        manager: Arc<M>,
        key: impl Into<String>,
        token: impl Into<String>,
        ttl: Duration,
    ) -> Self
    where
        M: LockManager + ?Sized + 'static,
    {
        let key = key.into();
        let token = token.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let period = (ttl / 3).max(Duration::from_millis(1));

        let handle = tokio::spawn(Self::run(
            manager,
            key.clone(),
            token,
            ttl,
            period,
            stop_rx,
        ));

        Self {
            key,
            stop_tx,
            handle,
        }
    }

    async fn run<M>(
        manager: Arc<M>,
        key: String,
        token: String,
        ttl: Duration,
        period: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<()>
    where
        M: LockManager + ?Sized,
    {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.acquire(&key, ttl, Some(token.as_str())).await {
                        warn!(key = %key, error = %e, "Lock renewal failed, giving up");
                        return Err(e);
                    }
                    debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock renewed");
                }
                _ = stop_rx.changed() => return Ok(()),
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True while renewals are still being issued.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Ask the renewal task to exit. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop renewing and report how renewal ended.
    ///
    /// Returns the renewal error if the lock was lost before the stop.
    pub async fn finish(mut self) -> Result<()> {
        self.stop();
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(LockError::backend(e)),
        }
    }
}

impl Drop for AutoRenewal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LocalLockManager, LocalLockOptions};

    fn local() -> Arc<LocalLockManager> {
        Arc::new(LocalLockManager::with_options(
            LocalLockOptions::default().with_reclaim_interval(Duration::ZERO),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_lock_alive_past_ttl() {
        let manager = local();
        let ttl = Duration::from_millis(300);
        let token = manager.acquire("job", ttl, None).await.unwrap();

        let renewal = AutoRenewal::start(manager.clone(), "job", token.clone(), ttl);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(renewal.is_active());
        assert!(manager.acquire("job", ttl, None).await.unwrap_err().is_contention());

        renewal.finish().await.unwrap();
        manager.release("job", &token).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_stop() {
        let manager = local();
        let ttl = Duration::from_millis(300);
        let token = manager.acquire("job", ttl, None).await.unwrap();

        let renewal = AutoRenewal::start(manager.clone(), "job", token, ttl);
        tokio::time::sleep(Duration::from_millis(500)).await;
        renewal.finish().await.unwrap();

        tokio::time::sleep(ttl).await;
        assert!(manager.acquire("job", ttl, None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_lock_is_lost() {
        let manager = local();
        let ttl = Duration::from_millis(300);
        manager.acquire("job", ttl, Some("holder")).await.unwrap();

        // Renewing under a token that does not own the lock fails on the first tick
        let renewal = AutoRenewal::start(manager.clone(), "job", "intruder", ttl);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!renewal.is_active());
        assert_eq!(renewal.key(), "job");
        assert!(renewal.finish().await.unwrap_err().is_contention());
    }
}
