//! Lock managers
//!
//! This module provides:
//! - The `LockManager` contract (acquire/renew/release)
//! - The in-memory lock store and its reclamation task
//! - The local lock manager built on top of them
//! - Retry and auto-renewal helpers that work with any backend
//! - A Redis-backed manager behind the `redis` feature

mod model;
mod reclaim;
mod renewal;
mod retry;
mod service;
mod store;
mod token;

#[cfg(feature = "redis")]
mod redis_store;

pub use model::*;
pub use reclaim::describe_metrics;
pub use renewal::AutoRenewal;
pub use retry::{RetryPolicy, RetryingLockManager};
pub use service::*;
pub use token::*;

#[cfg(feature = "redis")]
pub use redis_store::RedisLockManager;
