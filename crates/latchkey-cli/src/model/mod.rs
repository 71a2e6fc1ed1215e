pub mod config;

pub use config::{Backend, Configuration, TokenStrategy};
