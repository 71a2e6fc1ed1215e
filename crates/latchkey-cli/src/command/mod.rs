//! Command line interface and command dispatch

mod contend;
mod demo;

pub use contend::{ContendArgs, ContendReport, run_contend};
pub use demo::{DemoArgs, DemoReport, run_demo};

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::model::Configuration;
use crate::model::config::{ConfigOverrides, DEFAULT_CONFIG_PATH};
use crate::startup::{LockBackend, run_with_shutdown, wait_for_shutdown_signal};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "latchkey", version, about = "Exercise Latchkey lock managers")]
pub struct Cli {
    /// Config file path, extension optional
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,
    /// Lock backend: local or redis
    #[arg(short = 'b', long = "backend", env = "LATCHKEY_BACKEND")]
    pub backend: Option<String>,
    #[arg(long = "redis-url", env = "LATCHKEY_REDIS_URL")]
    pub redis_url: Option<String>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    /// Sweep period of the local backend; 0 disables the sweep
    #[arg(long = "reclaim-interval-ms")]
    pub reclaim_interval_ms: Option<u64>,
    /// Print Prometheus-formatted metrics when the command finishes
    #[arg(long = "metrics")]
    pub metrics: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Walk one key through acquire, contention, renewal, expiry and release
    Demo(DemoArgs),
    /// Run workers contending for one key and verify they never overlap
    Contend(ContendArgs),
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            backend: self.backend.clone(),
            redis_url: self.redis_url.clone(),
            log_level: self.log_level.clone(),
            reclaim_interval_ms: self.reclaim_interval_ms,
        }
    }
}

pub async fn run(cli: Cli, configuration: &Configuration) -> anyhow::Result<()> {
    // The recorder must exist before the backend starts emitting
    let metrics = if cli.metrics {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install metrics recorder")?;
        latchkey_lock::describe_metrics();
        Some(handle)
    } else {
        None
    };

    let backend = LockBackend::from_config(configuration).await?;
    let manager = backend.manager();
    let shutdown = wait_for_shutdown_signal();

    let result = match &cli.command {
        Command::Demo(args) => {
            match run_with_shutdown(run_demo(manager.as_ref(), args), shutdown.subscribe()).await {
                Some(Ok(report)) => {
                    println!("{}", report);
                    Ok(())
                }
                Some(Err(e)) => Err(e),
                None => Ok(()),
            }
        }
        Command::Contend(args) => {
            let policy = configuration.retry_policy();
            run_contend(manager, args, policy, shutdown.subscribe())
                .await
                .and_then(|report| {
                    println!("{}", report);
                    report.check()
                })
        }
    };

    backend.shutdown().await;
    info!(backend = %backend.kind(), "Lock backend shut down");

    if let Some(handle) = metrics {
        print!("{}", handle.render());
    }

    result
}
