//! Latchkey Lock - TTL-bounded, token-owned mutual exclusion
//!
//! This crate provides:
//! - The `LockManager` contract shared by every backend
//! - `LocalLockManager`: the in-process engine with background reclamation
//! - Token generators for lock ownership credentials
//! - `RetryingLockManager` and `AutoRenewal` helpers layered on the contract
//! - `RedisLockManager` (feature `redis`) for locks shared across processes

pub mod lock;

pub use latchkey_common::{LockError, Result};

// Re-export lock types
pub use lock::{
    AutoRenewal, LocalLockManager, LocalLockOptions, LockManager, LockStats,
    ProcessTokenGenerator, RetryPolicy, RetryingLockManager, TokenGenerator, UuidTokenGenerator,
    MAX_TTL, describe_metrics,
};

#[cfg(feature = "redis")]
pub use lock::RedisLockManager;
