//! shardfetch CLI - resumable shard downloads from the command line.

mod commands;
mod config;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shardfetch::logging::init_logging;

use crate::config::CliConfig;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "shardfetch")]
#[command(about = "Resumable, crash-safe downloader for ledger history shards", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/shardfetch/config.ini)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download registered shards, resuming any interrupted download
    Run(commands::run::RunArgs),
    /// Show pending shards and stored bytes
    Status(commands::status::StatusArgs),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = execute(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn execute(cli: Cli) -> Result<(), CliError> {
    let config = CliConfig::load(cli.config.as_deref())?;
    let _logging = init_logging(config.logging.clone().verbose(cli.verbose))?;

    match cli.command {
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| CliError::Runtime(e.to_string()))?;
            runtime.block_on(commands::run::run(args, config))
        }
        Commands::Status(args) => commands::status::run(args, config),
    }
}
