//! Blast CLI - Command-line interface
//!
//! Provides command-line access to the Blast download engine.

mod commands;

use std::path::PathBuf;

use blast_core::tracing_setup::{CliLogLevel, init_tracing};
use clap::Parser;

#[derive(Parser)]
#[command(name = "blast")]
#[command(about = "A BitTorrent client with an optional encrypted transport")]
#[command(version)]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: CliLogLevel,

    /// Also write a full trace of the run into this directory
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
