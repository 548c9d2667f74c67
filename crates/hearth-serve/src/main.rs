// ABOUTME: Entry point for hearthd, the pool broker daemon
// ABOUTME: Parses flags, loads config, serves until a shutdown signal

use anyhow::Result;
use clap::Parser;
use hearth_core::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hearthd")]
#[command(about = "Broker daemon keeping a warm pool of worker processes")]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(long = "sock")]
    socket: Option<String>,

    /// Workers kept alive at all times
    #[arg(long)]
    min_pool_size: Option<usize>,

    /// Idle workers kept ready for immediate checkout
    #[arg(long = "min-available")]
    min_available: Option<usize>,

    /// Reuse workers instead of recycling them after each use
    #[arg(long)]
    no_single_use: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(size) = cli.min_pool_size {
        config.min_pool_size = size;
    }
    if let Some(count) = cli.min_available {
        config.min_available_count = count;
    }
    if cli.no_single_use {
        config.single_use = false;
    }
    if cli.debug {
        config.debug = true;
    }
    config.validate()?;

    hearth_log::init_with_debug(config.debug);

    let exit_code = hearth_serve::run(config).await?;
    std::process::exit(exit_code);
}
