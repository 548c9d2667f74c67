// ABOUTME: Entry point for hearth, the pool client
// ABOUTME: Ensures a broker is running, checks out a worker, and attaches to it

use anyhow::Result;
use clap::Parser;
use hearth_core::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(about = "Attach to a warm worker from the pool")]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket of the broker
    #[arg(long = "sock")]
    socket: Option<String>,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Arguments passed through to the attach client
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    attach_args: Vec<String>,
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
    if cli.debug {
        config.debug = true;
    }
    config.validate()?;

    hearth_log::init_with_debug(config.debug);

    hearth_cli::run(config, cli.config, cli.attach_args).await
}
