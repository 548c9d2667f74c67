// ABOUTME: Spawns worker processes and watches them become ready
// ABOUTME: Output is buffered until the ready marker, then forwarded to the log

use crate::config::{render_args, WorkerConfig};
use crate::pool::PoolError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A worker process that has printed its ready marker. The caller decides
/// when to insert it into the pool and who supervises the child from there.
#[derive(Debug)]
pub(crate) struct Started {
    pub child: Child,
    pub pid: Option<u32>,
    /// Remaining output lines, merged from stdout and stderr
    pub lines: mpsc::Receiver<String>,
    /// Reader tasks feeding `lines`; aborting them closes the pipes
    pub readers: Vec<JoinHandle<()>>,
}

/// Spawn the worker program bound to `id` and wait for its ready marker.
///
/// Everything the worker prints before the marker is buffered so a startup
/// failure can be diagnosed; if the output streams close before the marker
/// appears, the buffered output is returned inside the error. There is no
/// readiness timeout: a worker that stays silent hangs its creator.
pub(crate) async fn start(config: &WorkerConfig, id: &str) -> Result<Started, PoolError> {
    let args = render_args(&config.spawn_args, id);

    let mut command = std::process::Command::new(&config.command);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Workers get their own process group; a ctrl-c on the broker's terminal
    // must not reach them, or the quit sequencing falls apart.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = tokio::process::Command::from(command)
        .spawn()
        .map_err(|source| PoolError::Spawn {
            id: id.to_string(),
            source,
        })?;
    let pid = child.id();

    let (tx, mut lines) = mpsc::channel::<String>(64);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(read_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(read_lines(stderr, tx.clone()));
    }
    drop(tx);

    let mut startup_output = Vec::new();
    loop {
        match lines.recv().await {
            Some(line) => {
                let ready = line.contains(&config.ready_marker);
                startup_output.push(line);
                if ready {
                    break;
                }
            }
            None => {
                // Streams closed without the marker: the worker died during
                // startup. Reap it and surface what it printed.
                for reader in readers {
                    reader.abort();
                }
                tokio::spawn(async move {
                    let _ = child.kill().await;
                });
                return Err(PoolError::Startup {
                    id: id.to_string(),
                    output: startup_output.join("\n"),
                });
            }
        }
    }

    Ok(Started {
        child,
        pid,
        lines,
        readers,
    })
}

/// Forward a ready worker's remaining output into the log under its id.
pub(crate) fn forward_output(id: String, mut lines: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            tracing::info!(worker = %id, "{}", line.trim_end());
        }
    })
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
