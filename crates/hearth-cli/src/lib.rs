// ABOUTME: Client-side flow: ensure a broker, check out a worker, attach
// ABOUTME: The broker connection is held open for the whole attach session

pub mod launch;

use anyhow::{bail, Context, Result};
use hearth_core::{config::render_args, Config};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;

/// Connect to the broker (starting one if needed), receive a worker
/// assignment, and run the attach client against it.
pub async fn run(config: Config, config_path: Option<PathBuf>, attach_args: Vec<String>) -> Result<()> {
    let socket_path = config.socket_path_expanded();
    if !socket_path.exists() {
        tracing::info!("Broker socket not found, starting one in the background");
        launch::start_broker(&config, config_path.as_deref()).await?;
    }

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", socket_path.display()))?;
    tracing::debug!("Connected to broker socket");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .context("Failed to read worker assignment")?;
    let worker_id = line.trim_end().to_string();
    if worker_id.is_empty() {
        bail!("Broker closed the connection without an assignment");
    }
    tracing::debug!(worker = %worker_id, "Received worker assignment");

    attach(&config, reader.into_inner(), &worker_id, attach_args).await
}

/// Arguments for the attach client: the id-selecting arguments from config,
/// then the pass-through arguments. The attach client refuses to start with
/// an empty argument list, so a lone default is supplied when none came in.
fn attach_command_args(config: &Config, worker_id: &str, mut extra: Vec<String>) -> Vec<String> {
    if extra.is_empty() {
        extra.push(".".to_string());
    }
    let mut args = render_args(&config.attach.attach_args, worker_id);
    args.extend(extra);
    args
}

/// Run the attach client with inherited stdio and hold the broker
/// connection open alongside it; closing that connection is what releases
/// the worker.
async fn attach(
    config: &Config,
    mut stream: UnixStream,
    worker_id: &str,
    attach_args: Vec<String>,
) -> Result<()> {
    let args = attach_command_args(config, worker_id, attach_args);
    let mut child = Command::new(&config.attach.command)
        .args(&args)
        .spawn()
        .with_context(|| format!("Failed to run {}", config.attach.command))?;

    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed waiting on attach client")?;
                tracing::debug!(%status, "Attach client closed, releasing worker");
                let _ = stream.shutdown().await;
                return Ok(());
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    // The broker went away; the attach client keeps running,
                    // but the worker behind it is no longer managed.
                    tracing::error!("Broker connection closed while attached");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(error) => {
                    tracing::error!(%error, "Broker connection error");
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_args_select_the_worker_then_pass_through() {
        let config = Config::default();
        let args = attach_command_args(&config, "abc", vec!["notes.org".to_string()]);
        assert_eq!(args, vec!["--socket-name=abc", "notes.org"]);
    }

    #[test]
    fn attach_args_get_a_default_when_none_are_given() {
        let config = Config::default();
        let args = attach_command_args(&config, "abc", vec![]);
        assert_eq!(args, vec!["--socket-name=abc", "."]);
    }
}
