//! Main entry point for the `latchkey` command line tool.
//!
//! Loads configuration, sets up logging and hands off to the selected
//! subcommand.

use clap::Parser;
use latchkey_cli::command::{self, Cli};
use latchkey_cli::model::Configuration;
use latchkey_cli::startup;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize configuration and logging
    let configuration = Configuration::load(&cli.config, &cli.overrides())?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %configuration.backend()?,
        "Starting latchkey"
    );

    command::run(cli, &configuration).await
}
