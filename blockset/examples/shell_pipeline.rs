//! Runs shell commands as a block set, like a shell pipeline.
//!
//! ```text
//! cargo run -p blockset --example shell_pipeline -- 'seq 1 100000' 'grep 7' 'wc -l'
//! ```
//!
//! The first Ctrl+C drains the pipeline from the last command to the first, the second one
//! stops it right away.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use blockset::BlockSetConfig;
use blockset::block::{IoBlock, ProcessBlock};
use blockset::error::ErrorKind;
use blockset::extract_load::ExtractLoadBlocks;
use blockset::set::BlockSet;
use clap::Parser;
use config::{Environment, load_config_from};
use telemetry::init_tracing;
use tokio::process::Command;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding `base` and environment configuration files, overrides the flags below.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Time in milliseconds each command is given to exit after the first Ctrl+C.
    #[arg(long, default_value_t = BlockSetConfig::DEFAULT_GRACE_PERIOD_MS)]
    grace_period_ms: u64,

    /// Capacity in bytes of the pipes between commands.
    #[arg(long, default_value_t = BlockSetConfig::DEFAULT_PIPE_BUFFER_SIZE)]
    pipe_buffer_size: usize,

    /// Shell commands, from the one producing data to the one consuming it.
    #[arg(required = true, num_args = 1..)]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _log_flusher = init_tracing("shell_pipeline")?;

    main_impl().await
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match &args.config_dir {
        Some(dir) => load_config_from::<BlockSetConfig>(dir, Environment::load()?)?,
        None => BlockSetConfig {
            pipe_buffer_size: args.pipe_buffer_size,
            grace_period_ms: args.grace_period_ms,
        },
    };

    info!(
        commands = args.commands.len(),
        pipe_buffer_size = config.pipe_buffer_size,
        grace_period_ms = config.grace_period_ms,
        "starting shell pipeline"
    );

    let set = Arc::new(ExtractLoadBlocks::with_config(
        shell_blocks(&args.commands),
        config,
    ));
    set.validate_set()?;

    let runner = tokio::spawn({
        let set = set.clone();
        async move { set.run().await }
    });
    let interrupts = tokio::spawn(handle_interrupts(set.clone()));

    let result = runner.await;
    interrupts.abort();

    match result {
        Ok(Ok(())) => info!("shell pipeline completed"),
        Ok(Err(err)) if err.kind() == ErrorKind::BlockSetTerminated => {
            warn!("shell pipeline was terminated")
        }
        Ok(Err(err)) => return Err(err.into()),
        Err(err) => return Err(err.into()),
    }

    for report in set.outcomes().unwrap_or_default() {
        info!(block = %report.name, outcome = ?report.outcome, "block outcome");
    }

    Ok(())
}

/// Wraps every command in a [`ProcessBlock`] running it through `sh -c`.
fn shell_blocks(commands: &[String]) -> Vec<Box<dyn IoBlock>> {
    let last = commands.len().saturating_sub(1);

    commands
        .iter()
        .enumerate()
        .map(|(position, script)| {
            let program = script.split_whitespace().next().unwrap_or("sh");
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);

            let block = ProcessBlock::new(
                format!("{position}-{program}"),
                command,
                position > 0,
                position < last,
            );

            Box::new(block) as Box<dyn IoBlock>
        })
        .collect()
}

async fn handle_interrupts(set: Arc<ExtractLoadBlocks>) {
    if ctrl_c().await.is_err() {
        return;
    }

    info!("interrupt received, draining the pipeline, press Ctrl+C again to stop it now");

    tokio::select! {
        _ = set.terminate(true) => {}
        Ok(()) = ctrl_c() => {
            warn!("second interrupt received, stopping the pipeline now");
            set.terminate(false).await;
        }
    }
}
