// ABOUTME: Unix-socket broker in front of the worker pool
// ABOUTME: Session lifecycle per connection plus ordered shutdown sequencing

use anyhow::{bail, Context, Result};
use hearth_core::{Config, Pool, READY_LINE};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the pool, bind the socket, and serve until a shutdown signal.
/// Returns the process exit code once the shutdown sequence has finished.
pub async fn run(config: Config) -> Result<i32> {
    let socket_path = config.socket_path_expanded();
    if socket_path.exists() {
        bail!(
            "Socket path {} already exists; is another broker running?",
            socket_path.display()
        );
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let pool = Pool::new(config)?;
    pool.init().await.context("Failed to start initial workers")?;

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    tracing::info!(socket = %socket_path.display(), "{}", READY_LINE);

    Ok(serve(&pool, listener, &socket_path).await)
}

/// Accept connections until SIGINT or SIGTERM, then run the shutdown
/// sequence. SIGTERM is the clean path (exit 0); SIGINT exits 1.
async fn serve(pool: &Arc<Pool>, listener: UnixListener, socket_path: &Path) -> i32 {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections: JoinSet<()> = JoinSet::new();

    let exit_code = loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
                break 1;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                break 0;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tracing::info!("Got new connection");
                    let pool = Arc::clone(pool);
                    let shutdown = shutdown_rx.clone();
                    connections.spawn(handle_connection(stream, pool, shutdown));
                }
                Err(error) => tracing::warn!(%error, "Failed to accept connection"),
            },
        }
    };

    shutdown(pool, listener, socket_path, shutdown_tx, connections).await;
    exit_code
}

/// The ordered teardown: sever sessions, close the listener, then destroy
/// the pool one worker at a time. A watchdog force-exits the process if any
/// step wedges.
async fn shutdown(
    pool: &Arc<Pool>,
    listener: UnixListener,
    socket_path: &Path,
    shutdown_tx: watch::Sender<bool>,
    mut connections: JoinSet<()>,
) {
    tracing::info!("Shutting down");
    let watchdog = tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        tracing::error!("Shutdown timed out, force exiting");
        std::process::exit(1);
    });

    // Sever every client session without running its release path; the pool
    // teardown below reclaims each worker anyway.
    let _ = shutdown_tx.send(true);
    while connections.join_next().await.is_some() {}

    drop(listener);
    if let Err(error) = std::fs::remove_file(socket_path) {
        tracing::warn!(%error, "Failed to remove socket file");
    }
    tracing::info!("Listener closed");

    pool.destroy().await;

    watchdog.abort();
    tracing::info!("Shutdown complete");
}

/// One client session: check a worker out, tell the peer its id, and hold
/// the connection as a liveness signal. The worker is released exactly once,
/// on peer-initiated close; a connection error does not release it, so an
/// error racing a close can never double-release.
async fn handle_connection(
    mut stream: UnixStream,
    pool: Arc<Pool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = match pool.take().await {
        Ok(id) => id,
        Err(error) => {
            tracing::error!(%error, "Could not assign a worker, dropping connection");
            return;
        }
    };
    tracing::info!(worker = %id, "Assigned worker to connection");

    if let Err(error) = stream.write_all(format!("{id}\n").as_bytes()).await {
        tracing::error!(worker = %id, %error, "Failed to write worker id to client");
        return;
    }

    // No further protocol flows here; we only watch for the peer going away.
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(worker = %id, "Connection severed by shutdown");
                return;
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => continue,
                Err(error) => {
                    tracing::error!(worker = %id, %error, "Unhandled connection error");
                    return;
                }
            },
        }
    }

    tracing::info!(worker = %id, "Connection closed, releasing worker");
    if !pool.give(&id).await {
        tracing::error!(worker = %id, "Failed to release worker");
    }
}
