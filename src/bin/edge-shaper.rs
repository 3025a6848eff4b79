//! CLI driver for the shaper control plane.
//!
//! The default invocation performs a full reload; `--updateonly` runs the
//! incremental path, `--validate` checks the inputs without mutating
//! anything, and `--clearrules` tears the shaping state down.

use clap::Parser;
use edge_shaper::{Config, Shaper, ShellExecutor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "edge-shaper",
    about = "Per-subscriber HTB/XDP bandwidth shaper control plane",
    version
)]
struct Cli {
    /// Be verbose
    #[arg(short, long)]
    verbose: bool,

    /// Print lots of debugging statements
    #[arg(short, long)]
    debug: bool,

    /// Only update to reflect changes in the subscriber table (partial reload)
    #[arg(long)]
    updateonly: bool,

    /// Just validate the topology document and subscriber table
    #[arg(long)]
    validate: bool,

    /// Clear IP filters, qdiscs, and XDP setup if any
    #[arg(long)]
    clearrules: bool,

    /// Configuration file (JSON)
    #[arg(long, default_value = "edge-shaper.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let config = if cli.config.exists() {
        match Config::from_file(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "could not load configuration");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let executor = Arc::new(ShellExecutor::new(&config));
    let shaper = match Shaper::new(config, executor) {
        Ok(shaper) => shaper,
        Err(e) => {
            error!(error = %e, "could not initialize shaper");
            return ExitCode::FAILURE;
        }
    };

    let result = if cli.validate {
        shaper.validate_inputs()
    } else if cli.clearrules {
        shaper.clear_rules().await
    } else if cli.updateonly {
        shaper.update_only().await.map(|summary| {
            println!(
                "partial reload applied: {} added, {} removed, {} resized, {} relocated, {} rewired",
                summary.added, summary.removed, summary.resized, summary.relocated, summary.rewired
            );
        })
    } else {
        shaper.full_reload().await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "operation failed");
            ExitCode::FAILURE
        }
    }
}
