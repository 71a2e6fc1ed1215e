//! Application startup utilities module.
//!
//! Logging, lock backend construction and shutdown plumbing shared by the
//! commands.

mod backend;
mod logging;
mod shutdown;

pub use backend::LockBackend;
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, run_with_shutdown, wait_for_shutdown_signal};
