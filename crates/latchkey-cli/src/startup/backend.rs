//! Lock backend construction from configuration

use std::sync::Arc;

use latchkey_lock::{LocalLockManager, LockManager};
use tracing::info;

use crate::model::{Backend, Configuration};

/// The configured lock manager plus what it takes to shut it down cleanly
pub struct LockBackend {
    kind: Backend,
    manager: Arc<dyn LockManager>,
    local: Option<Arc<LocalLockManager>>,
}

impl LockBackend {
    pub async fn from_config(configuration: &Configuration) -> anyhow::Result<Self> {
        match configuration.backend()? {
            Backend::Local => {
                let options = configuration.local_lock_options()?;
                info!(
                    reclaim_interval_ms = options.reclaim_interval.as_millis() as u64,
                    "Using in-process lock manager"
                );
                Ok(Self::local(LocalLockManager::with_options(options)))
            }
            Backend::Redis => connect_redis(configuration).await,
        }
    }

    pub fn local(manager: LocalLockManager) -> Self {
        let manager = Arc::new(manager);
        Self {
            kind: Backend::Local,
            manager: manager.clone(),
            local: Some(manager),
        }
    }

    pub fn kind(&self) -> Backend {
        self.kind
    }

    pub fn manager(&self) -> Arc<dyn LockManager> {
        self.manager.clone()
    }

    /// The in-process manager, when that is the active backend
    pub fn local_manager(&self) -> Option<&LocalLockManager> {
        self.local.as_deref()
    }

    pub async fn shutdown(&self) {
        if let Some(local) = &self.local {
            local.shutdown().await;
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(configuration: &Configuration) -> anyhow::Result<LockBackend> {
    use anyhow::Context;
    use latchkey_lock::{ProcessTokenGenerator, RedisLockManager, UuidTokenGenerator};

    use crate::model::TokenStrategy;

    let url = configuration.redis_url();
    let mut manager = RedisLockManager::connect(&url)
        .await
        .with_context(|| format!("failed to connect to redis at {}", url))?;

    if let Some(prefix) = configuration.redis_key_prefix() {
        manager = manager.with_key_prefix(prefix);
    }
    manager = match configuration.token_strategy()? {
        TokenStrategy::Uuid => manager.with_token_generator(UuidTokenGenerator),
        TokenStrategy::Process => manager.with_token_generator(ProcessTokenGenerator::new()),
    };

    info!(url = %url, "Using redis lock manager");
    Ok(LockBackend {
        kind: Backend::Redis,
        manager: Arc::new(manager),
        local: None,
    })
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_configuration: &Configuration) -> anyhow::Result<LockBackend> {
    anyhow::bail!("the redis backend requires building latchkey with the 'redis' feature")
}
