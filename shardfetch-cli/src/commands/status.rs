//! The `status` command: list pending shards and stored bytes.

use std::path::PathBuf;

use clap::Args;
use shardfetch::{store, TaskQueue};

use super::common::format_size;
use crate::config::CliConfig;
use crate::error::CliError;

/// Arguments for the `status` command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Directory holding the task and chunk tables
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

/// Run the status command.
///
/// Fails while a `run` in another process holds the state directory.
pub fn run(args: StatusArgs, config: CliConfig) -> Result<(), CliError> {
    let config = config.with_overrides(args.state_dir, None);
    let downloader = &config.downloader;

    let queue = TaskQueue::open(downloader.task_table_path())?;
    let sink = store::open_sink(downloader.sink, &downloader.chunk_table_path(), downloader.chunk_limit)?;

    println!("State directory: {}", downloader.state_dir.display());

    if queue.is_empty() {
        println!("No pending shards.");
        return Ok(());
    }

    let owner = sink.owner();
    let stored = sink.current_size();
    println!("Pending shards: {}", queue.len());
    for (position, task) in queue.tasks().iter().enumerate() {
        let progress = if owner == Some(task.id) {
            format!(" ({} stored)", format_size(stored))
        } else {
            String::new()
        };
        println!("  {:>3}. shard {:<8} {}{}", position + 1, task.id, task.source, progress);
    }
    Ok(())
}
