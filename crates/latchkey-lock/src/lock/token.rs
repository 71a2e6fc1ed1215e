//! Lock token generators
//!
//! A token is an opaque ownership credential. The store only ever compares
//! tokens for exact equality, so any string scheme works as long as two
//! independent callers never produce the same value.

use std::sync::Arc;

use uuid::Uuid;

/// Produces an ownership token for a lock on `key`
///
/// Any `Fn(&str) -> String + Send + Sync` closure is a generator.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self, key: &str) -> String;
}

impl<F> TokenGenerator for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn generate(&self, key: &str) -> String {
        self(key)
    }
}

/// Time-sortable random tokens (UUIDv7), independent of the key
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTokenGenerator;

impl TokenGenerator for UuidTokenGenerator {
    fn generate(&self, _key: &str) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Tokens of the form `host:pid:uuid`
///
/// Handy when lock holders show up in logs and you want to know which
/// process owns a key.
#[derive(Debug, Clone)]
pub struct ProcessTokenGenerator {
    prefix: String,
}

impl ProcessTokenGenerator {
    pub fn new() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self::with_prefix(format!("{}:{}", host, std::process::id()))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for ProcessTokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator for ProcessTokenGenerator {
    fn generate(&self, _key: &str) -> String {
        format!("{}:{}", self.prefix, Uuid::now_v7().simple())
    }
}

pub(crate) fn default_token_generator() -> Arc<dyn TokenGenerator> {
    Arc::new(UuidTokenGenerator)
}
