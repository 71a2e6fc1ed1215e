//! Lock data model

use std::time::Duration;

use latchkey_common::{LockError, Result};
use tokio::time::Instant;

/// Longest TTL any backend accepts
///
/// Redis takes `PX` as a signed 64-bit millisecond count.
pub const MAX_TTL: Duration = Duration::from_millis(i64::MAX as u64);

/// A lock entry as held by the in-memory store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    /// Ownership credential presented on renew and release
    pub token: String,
    /// Instant after which the lock no longer counts as held
    pub expires_at: Instant,
}

impl LockEntry {
    pub fn new(token: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// A lock is valid strictly before its expiry instant.
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_owned_by(&self, token: &str) -> bool {
        self.token == token
    }

    /// Remaining lifetime, zero once expired
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Lock store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Entries currently in the store, expired or not
    pub entries: usize,
    /// Entries that are still valid
    pub active_locks: usize,
    /// Entries removed by the reclamation task since startup
    pub reclaimed_total: u64,
}

/// Rejects requests no backend can serve meaningfully.
pub(crate) fn validate_acquire(key: &str, ttl: Duration) -> Result<()> {
    validate_key(key)?;
    if ttl.is_zero() {
        return Err(LockError::InvalidArgument(format!(
            "ttl for lock '{}' must be positive",
            key
        )));
    }
    if ttl > MAX_TTL {
        return Err(LockError::InvalidArgument(format!(
            "ttl for lock '{}' exceeds the maximum of {:?}",
            key, MAX_TTL
        )));
    }
    Ok(())
}

/// Expiry instant of a lock granted or renewed at `now`.
pub(crate) fn expiry(key: &str, now: Instant, ttl: Duration) -> Result<Instant> {
    now.checked_add(ttl).ok_or_else(|| {
        LockError::InvalidArgument(format!(
            "ttl for lock '{}' is too large to represent",
            key
        ))
    })
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(LockError::InvalidArgument(
            "lock key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// An empty caller token means "generate one for me".
pub(crate) fn supplied_token(token: Option<&str>) -> Option<&str> {
    token.filter(|t| !t.is_empty())
}
