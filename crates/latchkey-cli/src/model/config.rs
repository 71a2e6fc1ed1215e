//! Configuration management for the Latchkey CLI
//!
//! Values are layered, lowest priority first: the optional config file
//! (`conf/latchkey.yml` by default), `LATCHKEY_*` environment variables
//! (`LATCHKEY_LOCK__BACKEND=redis` sets `lock.backend`), then command line
//! flags.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use config::{Config, Environment};
use latchkey_lock::{
    LocalLockOptions, ProcessTokenGenerator, RetryPolicy, UuidTokenGenerator,
};
use tracing::Level;

use crate::startup::{LogRotation, LoggingConfig};

pub const DEFAULT_CONFIG_PATH: &str = "conf/latchkey";
pub const DEFAULT_RECLAIM_INTERVAL_MS: i64 = 60_000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";

pub const LOCK_BACKEND: &str = "lock.backend";
pub const LOCK_RECLAIM_INTERVAL_MS: &str = "lock.reclaim_interval_ms";
pub const LOCK_TOKEN_STRATEGY: &str = "lock.token_strategy";
pub const LOCK_REDIS_URL: &str = "lock.redis_url";
pub const LOCK_REDIS_KEY_PREFIX: &str = "lock.redis_key_prefix";
pub const LOCK_RETRY_MAX_ATTEMPTS: &str = "lock.retry.max_attempts";
pub const LOCK_RETRY_BASE_DELAY_MS: &str = "lock.retry.base_delay_ms";
pub const LOCK_RETRY_MAX_DELAY_MS: &str = "lock.retry.max_delay_ms";
pub const LOCK_RETRY_JITTER: &str = "lock.retry.jitter";
pub const LOG_LEVEL: &str = "log.level";
pub const LOG_CONSOLE: &str = "log.console";
pub const LOG_FILE: &str = "log.file";
pub const LOG_DIR: &str = "log.dir";
pub const LOG_ROTATION: &str = "log.rotation";

/// Which `LockManager` implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Redis,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "redis" => Ok(Self::Redis),
            other => bail!("unknown lock backend '{}', expected 'local' or 'redis'", other),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

/// How tokens are generated for callers that do not supply one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStrategy {
    Uuid,
    Process,
}

impl FromStr for TokenStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uuid" => Ok(Self::Uuid),
            "process" => Ok(Self::Process),
            other => bail!("unknown token strategy '{}', expected 'uuid' or 'process'", other),
        }
    }
}

/// Command line values that take precedence over file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub backend: Option<String>,
    pub redis_url: Option<String>,
    pub log_level: Option<String>,
    pub reclaim_interval_ms: Option<u64>,
}

/// Application configuration loaded from the config file and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn load(path: &str, overrides: &ConfigOverrides) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("LATCHKEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(v) = &overrides.backend {
            builder = builder.set_override(LOCK_BACKEND, v.as_str())?;
        }
        if let Some(v) = &overrides.redis_url {
            builder = builder.set_override(LOCK_REDIS_URL, v.as_str())?;
        }
        if let Some(v) = &overrides.log_level {
            builder = builder.set_override(LOG_LEVEL, v.as_str())?;
        }
        if let Some(v) = overrides.reclaim_interval_ms {
            builder = builder.set_override(LOCK_RECLAIM_INTERVAL_MS, v)?;
        }

        let config = builder
            .build()
            .with_context(|| format!("failed to load configuration from '{}'", path))?;

        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Configuration { config }
    }

    // ========================================================================
    // Lock Configuration
    // ========================================================================

    pub fn backend(&self) -> anyhow::Result<Backend> {
        self.config
            .get_string(LOCK_BACKEND)
            .map(|v| v.parse())
            .unwrap_or(Ok(Backend::Local))
    }

    pub fn reclaim_interval(&self) -> Duration {
        let ms = self
            .config
            .get_int(LOCK_RECLAIM_INTERVAL_MS)
            .unwrap_or(DEFAULT_RECLAIM_INTERVAL_MS);
        Duration::from_millis(ms.max(0) as u64)
    }

    pub fn token_strategy(&self) -> anyhow::Result<TokenStrategy> {
        self.config
            .get_string(LOCK_TOKEN_STRATEGY)
            .map(|v| v.parse())
            .unwrap_or(Ok(TokenStrategy::Uuid))
    }

    pub fn redis_url(&self) -> String {
        self.config
            .get_string(LOCK_REDIS_URL)
            .unwrap_or(DEFAULT_REDIS_URL.to_string())
    }

    pub fn redis_key_prefix(&self) -> Option<String> {
        self.config.get_string(LOCK_REDIS_KEY_PREFIX).ok()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let millis = |key: &str, default: Duration| {
            self.config
                .get_int(key)
                .map(|v| Duration::from_millis(v.max(0) as u64))
                .unwrap_or(default)
        };

        RetryPolicy {
            max_attempts: self
                .config
                .get_int(LOCK_RETRY_MAX_ATTEMPTS)
                .map(|v| v.clamp(1, u32::MAX as i64) as u32)
                .unwrap_or(defaults.max_attempts),
            base_delay: millis(LOCK_RETRY_BASE_DELAY_MS, defaults.base_delay),
            max_delay: millis(LOCK_RETRY_MAX_DELAY_MS, defaults.max_delay),
            jitter: self
                .config
                .get_bool(LOCK_RETRY_JITTER)
                .unwrap_or(defaults.jitter),
        }
    }

    pub fn local_lock_options(&self) -> anyhow::Result<LocalLockOptions> {
        let options = LocalLockOptions::default().with_reclaim_interval(self.reclaim_interval());
        Ok(match self.token_strategy()? {
            TokenStrategy::Uuid => options.with_token_generator(UuidTokenGenerator),
            TokenStrategy::Process => options.with_token_generator(ProcessTokenGenerator::new()),
        })
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        let defaults = LoggingConfig::default();
        let level = self
            .config
            .get_string(LOG_LEVEL)
            .ok()
            .and_then(|v| v.parse::<Level>().ok())
            .unwrap_or(defaults.console_level);

        LoggingConfig {
            log_dir: self
                .config
                .get_string(LOG_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            console_output: self
                .config
                .get_bool(LOG_CONSOLE)
                .unwrap_or(defaults.console_output),
            console_level: level,
            file_logging: self
                .config
                .get_bool(LOG_FILE)
                .unwrap_or(defaults.file_logging),
            file_level: level,
            rotation: self
                .config
                .get_string(LOG_ROTATION)
                .ok()
                .and_then(|v| v.parse::<LogRotation>().ok())
                .unwrap_or(defaults.rotation),
        }
    }
}
