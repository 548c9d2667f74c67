// ABOUTME: Bootstrap launcher: starts hearthd in the background when absent
// ABOUTME: Waits for the broker's readiness line before letting the client connect

use anyhow::{bail, Context, Result};
use hearth_core::{Config, READY_LINE};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawn a detached `hearthd` and wait until it reports readiness.
pub async fn start_broker(config: &Config, config_path: Option<&Path>) -> Result<()> {
    start_broker_at(&broker_executable(), config, config_path).await
}

/// The broker's output is read incrementally; pre-ready lines only surface
/// under debug logging. Once the readiness line appears the pipes are
/// dropped and the broker lives on in the background.
async fn start_broker_at(
    executable: &Path,
    config: &Config,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut command = std::process::Command::new(executable);
    command.arg("--sock").arg(&config.socket_path);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    if config.debug {
        command.arg("--debug");
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // The broker must outlive this client and must not share its terminal's
    // signal delivery, so it gets its own process group.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = tokio::process::Command::from(command)
        .spawn()
        .with_context(|| format!("Failed to start broker {}", executable.display()))?;

    let (tx, mut lines) = mpsc::channel::<String>(64);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(read_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(read_lines(stderr, tx.clone()));
    }
    drop(tx);

    while let Some(line) = lines.recv().await {
        tracing::debug!(broker = %line.trim_end(), "Broker output");
        if line.contains(READY_LINE) {
            tracing::debug!("Broker is ready, connecting");
            for reader in readers {
                reader.abort();
            }
            return Ok(());
        }
    }

    bail!("Broker exited before becoming ready")
}

/// Prefer a `hearthd` sitting next to this binary; fall back to PATH.
fn broker_executable() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("hearthd");
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("hearthd")
}

fn read_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    })
}
