//! Latchkey CLI - drives the lock managers from the command line
//!
//! This crate provides:
//! - Configuration loading (file, environment, flags)
//! - Logging and shutdown plumbing
//! - The `demo` and `contend` commands

pub mod command;
pub mod model;
pub mod startup;
