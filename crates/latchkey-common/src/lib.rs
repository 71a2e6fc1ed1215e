//! Latchkey Common - Shared types for the lock crates
//!
//! This crate provides:
//! - `LockError`: the error taxonomy every `LockManager` backend reports
//! - `Result`: a result alias over `LockError`

pub mod error;

// Re-exports for convenience
pub use error::{LockError, Result};
