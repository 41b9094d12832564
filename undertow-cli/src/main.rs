//! Undertow CLI - Command-line interface
//!
//! Provides command-line access to the Undertow session engine.

mod commands;

use clap::Parser;
use undertow_core::tracing_setup::{init_tracing, CliLogLevel};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "A BitTorrent session engine")]
struct Cli {
    /// Console log verbosity
    #[arg(long, default_value = "warn")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    commands::handle_command(cli.command).await
}
