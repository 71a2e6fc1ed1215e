//! Lock manager contract and the in-process implementation

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_common::Result;
use tokio::time::Instant;

use super::model::{LockStats, supplied_token, validate_acquire, validate_key};
use super::reclaim::Reclaimer;
use super::store::LockStore;
use super::token::{TokenGenerator, default_token_generator};

/// Default sweep period of the local manager
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Lock manager contract
///
/// Both operations are single, fail-fast attempts: they never wait for a
/// contended lock to become free. Callers that want to wait wrap a manager
/// in [`RetryingLockManager`](super::RetryingLockManager).
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire or renew the lock on `key` for `ttl`.
    ///
    /// Returns the token that owns the lock. Passing the token of a lock you
    /// still hold renews it for `ttl` from now. `None` (or an empty token)
    /// asks the manager to generate one.
    ///
    /// Fails with `LockAlreadyTaken` while someone else holds a valid lock.
    async fn acquire(&self, key: &str, ttl: Duration, token: Option<&str>) -> Result<String>;

    /// Release the lock on `key` held under `token`.
    ///
    /// Releasing a key that is not held (never acquired, already released or
    /// expired) succeeds. Fails with `UnlockNotPermitted` when a valid lock
    /// is held under another token.
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

#[async_trait]
impl<T> LockManager for Arc<T>
where
    T: LockManager + ?Sized,
{
    async fn acquire(&self, key: &str, ttl: Duration, token: Option<&str>) -> Result<String> {
        (**self).acquire(key, ttl, token).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        (**self).release(key, token).await
    }
}

/// Construction options for [`LocalLockManager`]
#[derive(Clone)]
pub struct LocalLockOptions {
    /// Period of the expired-entry sweep; zero disables the sweep
    pub reclaim_interval: Duration,
    /// Generates tokens for callers that do not bring their own
    pub token_generator: Arc<dyn TokenGenerator>,
}

impl Default for LocalLockOptions {
    fn default() -> Self {
        Self {
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            token_generator: default_token_generator(),
        }
    }
}

impl fmt::Debug for LocalLockOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLockOptions")
            .field("reclaim_interval", &self.reclaim_interval)
            .finish_non_exhaustive()
    }
}

impl LocalLockOptions {
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_token_generator<G>(mut self, generator: G) -> Self
    where
        G: TokenGenerator + 'static,
    {
        self.token_generator = Arc::new(generator);
        self
    }
}

/// In-process lock manager
///
/// All state lives in this process and is lost on restart. One mutex guards
/// the whole key map, so acquire, release and the background sweep are
/// linearized per manager.
pub struct LocalLockManager {
    store: Arc<LockStore>,
    token_generator: Arc<dyn TokenGenerator>,
    reclaimer: Reclaimer,
}

impl LocalLockManager {
    /// Create a manager with the default sweep period and token generator.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, which hosts the sweep.
    pub fn new() -> Self {
        Self::with_options(LocalLockOptions::default())
    }

    /// # Panics
    ///
    /// Must be called from within a Tokio runtime unless the reclaim
    /// interval is zero.
    pub fn with_options(options: LocalLockOptions) -> Self {
        let store = Arc::new(LockStore::new());
        let reclaimer = Reclaimer::spawn(store.clone(), options.reclaim_interval);

        Self {
            store,
            token_generator: options.token_generator,
            reclaimer,
        }
    }

    /// Acquire without going through the async contract.
    pub fn try_acquire(&self, key: &str, ttl: Duration, token: Option<&str>) -> Result<String> {
        validate_acquire(key, ttl)?;
        self.store.acquire(key, ttl, supplied_token(token), Instant::now(), || {
            self.token_generator.generate(key)
        })
    }

    /// Release without going through the async contract.
    pub fn try_release(&self, key: &str, token: &str) -> Result<()> {
        validate_key(key)?;
        self.store.release(key, token, Instant::now())
    }

    /// Stop the background sweep.
    ///
    /// Idempotent and callable concurrently. Once it returns, the sweep will
    /// not touch the store again. Locks keep working; expired entries are
    /// simply no longer collected.
    pub fn stop(&self) {
        self.reclaimer.stop();
    }

    /// Stop the background sweep and wait for its task to finish.
    pub async fn shutdown(&self) {
        self.reclaimer.shutdown().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.reclaimer.is_stopped()
    }

    /// Number of entries in the store, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the store still has an entry for `key`, valid or not
    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    /// Remaining lifetime of the valid lock on `key`, if any
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.store
            .get(key)
            .filter(|entry| entry.is_valid(now))
            .map(|entry| entry.remaining(now))
    }

    pub fn stats(&self) -> LockStats {
        self.store.stats(Instant::now())
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, key: &str, ttl: Duration, token: Option<&str>) -> Result<String> {
        self.try_acquire(key, ttl, token)
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        self.try_release(key, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_common::LockError;

    fn manager_without_sweep() -> LocalLockManager {
        LocalLockManager::with_options(
            LocalLockOptions::default().with_reclaim_interval(Duration::ZERO),
        )
    }

    #[test]
    fn test_works_outside_runtime_when_sweep_disabled() {
        let manager = manager_without_sweep();
        assert!(manager.is_stopped());

        let token = manager.try_acquire("job", Duration::from_secs(1), None).unwrap();
        assert!(manager.try_release("job", &token).is_ok());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_empty_token_means_generate() {
        let manager = LocalLockManager::with_options(
            LocalLockOptions::default()
                .with_reclaim_interval(Duration::ZERO)
                .with_token_generator(|key: &str| format!("{}-owner", key)),
        );

        let token = manager.try_acquire("job", Duration::from_secs(1), Some("")).unwrap();
        assert_eq!(token, "job-owner");
    }

    #[test]
    fn test_rejects_invalid_arguments() {
        let manager = manager_without_sweep();
        assert!(matches!(
            manager.try_acquire("", Duration::from_secs(1), None),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.try_acquire("job", Duration::ZERO, None),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.try_release("", "token"),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_huge_ttl_is_rejected_not_panicking() {
        let manager = manager_without_sweep();
        assert!(matches!(
            manager.acquire("job", Duration::MAX, None).await,
            Err(LockError::InvalidArgument(_))
        ));
        assert!(manager.is_empty());

        // Renewing a held lock with it fails the same way and keeps the lock
        let token = manager.acquire("job", Duration::from_secs(1), None).await.unwrap();
        assert!(matches!(
            manager.acquire("job", Duration::MAX, Some(token.as_str())).await,
            Err(LockError::InvalidArgument(_))
        ));
        assert!(manager.remaining_ttl("job").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_ttl_tracks_renewal() {
        let manager = manager_without_sweep();
        let ttl = Duration::from_millis(100);
        let token = manager.acquire("job", ttl, None).await.unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(manager.remaining_ttl("job"), Some(Duration::from_millis(40)));

        manager.acquire("job", ttl, Some(token.as_str())).await.unwrap();
        assert_eq!(manager.remaining_ttl("job"), Some(ttl));

        tokio::time::advance(ttl).await;
        assert_eq!(manager.remaining_ttl("job"), None);
        assert!(manager.contains("job"));
    }

    #[tokio::test]
    async fn test_usable_through_trait_object() {
        let manager: Arc<dyn LockManager> = Arc::new(manager_without_sweep());
        let token = manager.acquire("job", Duration::from_secs(1), None).await.unwrap();
        assert!(manager.acquire("job", Duration::from_secs(1), None).await.unwrap_err().is_contention());
        manager.release("job", &token).await.unwrap();
    }

    #[test]
    fn test_options_debug_omits_generator() {
        let rendered = format!("{:?}", LocalLockOptions::default());
        assert!(rendered.contains("reclaim_interval"));
    }
}
