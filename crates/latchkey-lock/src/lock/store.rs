//! In-memory lock store
//!
//! Every read and write of the key map happens under one mutex, held for the
//! whole check-then-act sequence. The guard is never held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use latchkey_common::{LockError, Result};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::model::{LockEntry, LockStats, expiry};

#[derive(Debug, Default)]
pub(crate) struct LockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
    reclaimed_total: AtomicU64,
}

impl LockStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Grant, renew or refuse `key` in one atomic step.
    ///
    /// `generate` is only invoked when a new lock is granted without a
    /// caller-supplied token.
    pub(crate) fn acquire<G>(
        &self,
        key: &str,
        ttl: Duration,
        token: Option<&str>,
        now: Instant,
        generate: G,
    ) -> Result<String>
    where
        G: FnOnce() -> String,
    {
        let expires_at = expiry(key, now, ttl)?;
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key)
            && entry.is_valid(now)
        {
            return match token {
                Some(token) if entry.is_owned_by(token) => {
                    entry.expires_at = expires_at;
                    Ok(entry.token.clone())
                }
                _ => Err(LockError::already_taken(key)),
            };
        }

        let token = match token {
            Some(token) => token.to_string(),
            None => generate(),
        };
        entries.insert(key.to_string(), LockEntry::new(token.clone(), expires_at));
        Ok(token)
    }

    /// Check-and-delete. Absent and expired entries count as released.
    pub(crate) fn release(&self, key: &str, token: &str, now: Instant) -> Result<()> {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get(key) else {
            return Ok(());
        };

        if entry.is_valid(now) && !entry.is_owned_by(token) {
            return Err(LockError::unlock_not_permitted(key));
        }

        entries.remove(key);
        Ok(())
    }

    /// Remove every expired entry.
    ///
    /// Returns `None` without touching the map once `stopped` is set; the flag
    /// is read under the mutex so a stop that has completed its barrier can
    /// never be followed by a sweep.
    pub(crate) fn reclaim(&self, now: Instant, stopped: &AtomicBool) -> Option<usize> {
        let mut entries = self.entries.lock();
        if stopped.load(Ordering::Acquire) {
            return None;
        }

        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid(now));
        let removed = before - entries.len();

        self.reclaimed_total
            .fetch_add(removed as u64, Ordering::Relaxed);
        Some(removed)
    }

    /// Wait out any in-flight critical section.
    pub(crate) fn barrier(&self) {
        drop(self.entries.lock());
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<LockEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub(crate) fn stats(&self, now: Instant) -> LockStats {
        let entries = self.entries.lock();
        LockStats {
            entries: entries.len(),
            active_locks: entries.values().filter(|e| e.is_valid(now)).count(),
            reclaimed_total: self.reclaimed_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_millis(100);

    fn counter_generator() -> impl FnMut() -> String {
        let mut n = 0;
        move || {
            n += 1;
            format!("gen-{}", n)
        }
    }

    #[test]
    fn test_acquire_absent_key_generates_token() {
        let store = LockStore::new();
        let now = Instant::now();

        let token = store
            .acquire("job", TTL, None, now, || "generated".to_string())
            .unwrap();
        assert_eq!(token, "generated");
        assert_eq!(store.get("job").unwrap().expires_at, now + TTL);
    }

    #[test]
    fn test_acquire_uses_supplied_token_without_generating() {
        let store = LockStore::new();
        let token = store
            .acquire("job", TTL, Some("mine"), Instant::now(), || {
                panic!("generator must not run")
            })
            .unwrap();
        assert_eq!(token, "mine");
    }

    #[test]
    fn test_contention_and_renewal() {
        let store = LockStore::new();
        let now = Instant::now();
        let token = store.acquire("job", TTL, None, now, || "a".to_string()).unwrap();

        let later = now + Duration::from_millis(50);
        assert!(store.acquire("job", TTL, None, later, || "b".to_string()).unwrap_err().is_contention());
        assert!(store.acquire("job", TTL, Some("b"), later, || unreachable!()).unwrap_err().is_contention());

        // Renewal extends from the call time
        let renewed = store.acquire("job", TTL, Some(token.as_str()), later, || unreachable!()).unwrap();
        assert_eq!(renewed, token);
        assert_eq!(store.get("job").unwrap().expires_at, later + TTL);
    }

    #[test]
    fn test_expired_entry_is_overwritten() {
        let store = LockStore::new();
        let now = Instant::now();
        store.acquire("job", TTL, None, now, || "a".to_string()).unwrap();

        let later = now + TTL;
        let token = store.acquire("job", TTL, None, later, || "b".to_string()).unwrap();
        assert_eq!(token, "b");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unrepresentable_ttl_leaves_store_untouched() {
        let store = LockStore::new();
        let now = Instant::now();

        let err = store
            .acquire("job", Duration::MAX, None, now, || "a".to_string())
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
        assert!(!store.contains("job"));

        // Renewal with an oversized TTL keeps the existing expiry
        store.acquire("job", TTL, Some("a"), now, || unreachable!()).unwrap();
        assert!(store.acquire("job", Duration::MAX, Some("a"), now, || unreachable!()).is_err());
        assert_eq!(store.get("job").unwrap().expires_at, now + TTL);
    }

    #[test]
    fn test_release_rules() {
        let store = LockStore::new();
        let now = Instant::now();

        // Absent key
        assert!(store.release("job", "anything", now).is_ok());

        store.acquire("job", TTL, Some("a"), now, || unreachable!()).unwrap();
        assert!(store.release("job", "b", now).unwrap_err().is_ownership_violation());
        assert_eq!(store.get("job").unwrap().token, "a");

        assert!(store.release("job", "a", now).is_ok());
        assert!(!store.contains("job"));
    }

    #[test]
    fn test_release_of_expired_entry_succeeds_for_anyone() {
        let store = LockStore::new();
        let now = Instant::now();
        store.acquire("job", TTL, Some("a"), now, || unreachable!()).unwrap();

        assert!(store.release("job", "b", now + TTL).is_ok());
        assert!(!store.contains("job"));
    }

    #[test]
    fn test_reclaim_removes_only_expired() {
        let store = LockStore::new();
        let stopped = AtomicBool::new(false);
        let now = Instant::now();
        store.acquire("short", TTL, None, now, || "a".to_string()).unwrap();
        store
            .acquire("long", Duration::from_secs(10), None, now, || "b".to_string())
            .unwrap();

        assert_eq!(store.reclaim(now + TTL, &stopped), Some(1));
        assert!(!store.contains("short"));
        assert!(store.contains("long"));
        assert_eq!(store.stats(now + TTL).reclaimed_total, 1);
    }

    #[test]
    fn test_reclaim_is_inert_once_stopped() {
        let store = LockStore::new();
        let stopped = AtomicBool::new(true);
        let now = Instant::now();
        store.acquire("job", TTL, None, now, || "a".to_string()).unwrap();

        assert_eq!(store.reclaim(now + TTL * 2, &stopped), None);
        assert!(store.contains("job"));
    }

    #[test]
    fn test_stats_counts_active_separately() {
        let store = LockStore::new();
        let now = Instant::now();
        store.acquire("a", TTL, None, now, || "1".to_string()).unwrap();
        store
            .acquire("b", Duration::from_secs(5), None, now, || "2".to_string())
            .unwrap();

        let stats = store.stats(now + TTL);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.active_locks, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire { key: usize, ttl_ms: u64, token: Option<usize> },
        Release { key: usize, token: usize },
        Advance { ms: u64 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 1..200u64, proptest::option::of(0..4usize))
                .prop_map(|(key, ttl_ms, token)| Op::Acquire { key, ttl_ms, token }),
            (0..3usize, 0..4usize).prop_map(|(key, token)| Op::Release { key, token }),
            (0..150u64).prop_map(|ms| Op::Advance { ms }),
        ]
    }

    proptest! {
        // The store must agree with a naive model where validity is `now < expires_at`.
        #[test]
        fn store_matches_reference_model(ops in proptest::collection::vec(op_strategy(), 1..80)) {
            let store = LockStore::new();
            let start = Instant::now();
            let mut elapsed_ms = 0u64;
            let mut model: HashMap<String, (String, u64)> = HashMap::new();
            let mut generate = counter_generator();
            let mut generated = 0usize;

            for op in ops {
                let now = start + Duration::from_millis(elapsed_ms);
                match op {
                    Op::Acquire { key, ttl_ms, token } => {
                        let key = format!("k{}", key);
                        let token = token.map(|t| format!("t{}", t));
                        let result = store.acquire(
                            &key,
                            Duration::from_millis(ttl_ms),
                            token.as_deref(),
                            now,
                            &mut generate,
                        );

                        let held = model.get(&key).filter(|(_, exp)| elapsed_ms < *exp).cloned();
                        match held {
                            Some((held_token, _)) if token.as_deref() == Some(held_token.as_str()) => {
                                prop_assert_eq!(result.unwrap(), held_token.clone());
                                model.insert(key, (held_token, elapsed_ms + ttl_ms));
                            }
                            Some(_) => {
                                prop_assert!(result.unwrap_err().is_contention());
                            }
                            None => {
                                let expected = token.unwrap_or_else(|| {
                                    generated += 1;
                                    format!("gen-{}", generated)
                                });
                                prop_assert_eq!(result.unwrap(), expected.clone());
                                model.insert(key, (expected, elapsed_ms + ttl_ms));
                            }
                        }
                    }
                    Op::Release { key, token } => {
                        let key = format!("k{}", key);
                        let token = format!("t{}", token);
                        let result = store.release(&key, &token, now);

                        match model.get(&key).cloned() {
                            Some((held, exp)) if elapsed_ms < exp && held != token => {
                                prop_assert!(result.unwrap_err().is_ownership_violation());
                            }
                            _ => {
                                prop_assert!(result.is_ok());
                                model.remove(&key);
                            }
                        }
                    }
                    Op::Advance { ms } => elapsed_ms += ms,
                }
            }
        }
    }
}
