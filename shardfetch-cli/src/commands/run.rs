//! The `run` command: download registered shards until the queue is empty.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use shardfetch::{CoordinatorEvent, DirectoryImporter, ReqwestTransport, TaskCoordinator};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::common::{format_size, ShardArg};
use crate::config::CliConfig;
use crate::error::CliError;

/// Arguments for the `run` command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Shard to register, as ID=URL (repeatable)
    #[arg(long = "shard", value_name = "ID=URL", value_parser = parse_shard)]
    pub shards: Vec<ShardArg>,

    /// Directory holding the task and chunk tables
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Directory completed archives are imported into
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,
}

fn parse_shard(s: &str) -> Result<ShardArg, String> {
    s.parse::<ShardArg>().map_err(|e| e.to_string())
}

/// Run the download command.
pub async fn run(args: RunArgs, config: CliConfig) -> Result<(), CliError> {
    let config = config.with_overrides(args.state_dir, args.archive_dir);
    let downloader = config.downloader;

    let transport = ReqwestTransport::with_settings(downloader.connect_timeout, &downloader.user_agent)
        .map_err(|e| CliError::Config(format!("Failed to create HTTP client: {}", e)))?;
    let importer = DirectoryImporter::new(&config.archive_dir);

    println!("State directory:   {}", downloader.state_dir.display());
    println!("Archive directory: {}", config.archive_dir.display());

    let coordinator = TaskCoordinator::open_deferred(downloader, Arc::new(transport), Arc::new(importer))?;

    for shard in &args.shards {
        if let Err(e) = coordinator.try_add(shard.index, &shard.url) {
            warn!(shard = shard.index, error = %e, "Shard not registered");
            println!("Skipping shard {}: {}", shard.index, e);
        }
    }

    let pending = coordinator.pending();
    if pending.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }
    println!("Downloading {} shard(s). Press Ctrl+C to stop; the next run resumes.", pending.len());
    println!();

    let stopper = coordinator.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("Received shutdown signal, saving progress...");
        stopper.stop();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let mut events = coordinator.subscribe();
    if !coordinator.start() {
        return Ok(());
    }
    info!(tasks = pending.len(), "Download started");

    let summary = watch_progress(&coordinator, &mut events).await;
    coordinator.wait_idle().await;

    println!();
    println!("Session Summary");
    println!("───────────────");
    println!("  Imported: {} ({})", summary.completed, format_size(summary.bytes));
    println!("  Dropped:  {}", summary.failed);
    let remaining = coordinator.pending().len();
    if remaining > 0 {
        println!("  Pending:  {} (run again to resume)", remaining);
    }
    Ok(())
}

#[derive(Default)]
struct Summary {
    completed: usize,
    failed: usize,
    bytes: u64,
}

/// Renders events and progress until the coordinator goes idle.
async fn watch_progress(
    coordinator: &TaskCoordinator,
    events: &mut tokio::sync::broadcast::Receiver<CoordinatorEvent>,
) -> Summary {
    let mut progress = coordinator.progress();
    let mut summary = Summary::default();

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg:12} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CoordinatorEvent::TaskStarted { task, offset }) => {
                    bar.reset();
                    bar.set_message(format!("shard {}", task));
                    bar.set_position(offset);
                }
                Ok(CoordinatorEvent::TaskCompleted { task, size }) => {
                    summary.completed += 1;
                    summary.bytes += size;
                    bar.println(format!("Shard {} imported ({})", task, format_size(size)));
                }
                Ok(CoordinatorEvent::TaskFailed { task, reason }) => {
                    summary.failed += 1;
                    bar.println(format!("Shard {} dropped: {}", task, reason));
                }
                Ok(CoordinatorEvent::TaskDeferred { task, reason }) => {
                    bar.println(format!("Shard {} moved to the back of the queue: {}", task, reason));
                }
                Ok(CoordinatorEvent::Halted { task, reason }) => {
                    bar.println(format!("Stopped at shard {}: {}", task, reason));
                }
                Ok(CoordinatorEvent::Paused) => bar.set_message("paused"),
                Ok(CoordinatorEvent::Resumed) => {}
                Ok(CoordinatorEvent::Idle) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => {}
            },
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = progress.borrow_and_update().clone();
                if let Some(state) = state {
                    if let Some(total) = state.total_size {
                        bar.set_length(total);
                    }
                    bar.set_position(state.downloaded_size);
                }
            }
        }
    }

    bar.finish_and_clear();
    summary
}
