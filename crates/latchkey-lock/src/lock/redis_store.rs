//! Redis-backed lock manager
//!
//! Same contract as the local manager, with the lock state kept in Redis so
//! every process pointed at the same server sees it. Each operation is one
//! Lua script, which Redis runs atomically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_common::{LockError, Result};
use redis::Script;
use redis::aio::ConnectionManager;

use super::model::{supplied_token, validate_acquire, validate_key};
use super::service::LockManager;
use super::token::{TokenGenerator, default_token_generator};

const DEFAULT_KEY_PREFIX: &str = "latchkey:lock:";

// Returns 1 when granted or renewed, 0 when held by another token.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
elseif current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

// Returns 1 when deleted or already gone, 0 when held by another token.
const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 1
elseif current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// Lock manager whose state lives in Redis
///
/// Expiry is delegated to Redis key TTLs, so there is no sweep task. The
/// manager does not retry; wrap it in
/// [`RetryingLockManager`](super::RetryingLockManager) for that.
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
    key_prefix: String,
    token_generator: Arc<dyn TokenGenerator>,
    acquire_script: Script,
    release_script: Script,
}

impl RedisLockManager {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            token_generator: default_token_generator(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(LockError::backend)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(LockError::backend)?;
        Ok(Self::new(conn))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_token_generator<G>(mut self, generator: G) -> Self
    where
        G: TokenGenerator + 'static,
    {
        self.token_generator = Arc::new(generator);
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration, token: Option<&str>) -> Result<String> {
        validate_acquire(key, ttl)?;
        let token = match supplied_token(token) {
            Some(token) => token.to_string(),
            None => self.token_generator.generate(key),
        };
        let ttl_ms = u64::try_from(ttl.as_millis())
            .map_err(|_| {
                LockError::InvalidArgument(format!("ttl for lock '{}' does not fit in milliseconds", key))
            })?
            .max(1);

        let mut conn = self.conn.clone();
        let granted: i64 = self
            .acquire_script
            .key(self.redis_key(key))
            .arg(&token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)?;

        if granted == 1 {
            Ok(token)
        } else {
            Err(LockError::already_taken(key))
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        validate_key(key)?;

        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_script
            .key(self.redis_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)?;

        if released == 1 {
            Ok(())
        } else {
            Err(LockError::unlock_not_permitted(key))
        }
    }
}
