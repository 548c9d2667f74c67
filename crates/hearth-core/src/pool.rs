// ABOUTME: Warm pool of worker processes with take/give checkout and auto-scaling
// ABOUTME: Debounced increase/cull passes and graceful-then-forced teardown

use crate::config::{render_args, Config};
use crate::worker::{self, Started};
use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const INCREASE_DEBOUNCE: Duration = Duration::from_millis(500);
const CULL_DEBOUNCE: Duration = Duration::from_secs(2);
const FORCE_KILL_DELAY: Duration = Duration::from_secs(2);

/// Errors surfaced by pool checkout and worker creation
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool has been destroyed")]
    Destroyed,

    #[error("failed to spawn worker {id}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {id} exited during startup:\n{output}")]
    Startup { id: String, output: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Available,
    Busy,
    Stopping,
}

/// A tracked worker. Entries exist from confirmed-ready until the process
/// exit is observed; the child handle itself lives in the supervision task.
struct Worker {
    state: WorkerState,
    pid: Option<u32>,
    /// One-shot trigger for the forced-kill escalation; taken when armed
    force_kill: Option<oneshot::Sender<()>>,
    /// Flips to true once the process exit has been observed
    exited: watch::Receiver<bool>,
    /// Reader and forwarder tasks for the worker's output
    forwarders: Vec<JoinHandle<()>>,
}

/// Point-in-time worker counts, grouped by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub stopping: usize,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<String, Worker>,
    /// Ids reserved by creations still waiting on their ready marker
    pending: HashSet<String>,
    destroyed: bool,
    increasing: bool,
    culling: bool,
    increase_timer: Option<JoinHandle<()>>,
    cull_timer: Option<JoinHandle<()>>,
}

impl PoolState {
    fn available_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.state == WorkerState::Available)
            .count()
    }

    fn pick_available(&self) -> Option<String> {
        self.workers
            .iter()
            .find(|(_, w)| w.state == WorkerState::Available)
            .map(|(id, _)| id.clone())
    }

    fn reserve_id(&mut self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            if let Some(id) = short_id(&mut rng) {
                if !self.workers.contains_key(&id) && !self.pending.contains(&id) {
                    self.pending.insert(id.clone());
                    return id;
                }
            }
        }
    }
}

/// Teardown handles grabbed while flagging a worker as stopping.
struct StopHandles {
    force_kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    was_stopping: bool,
}

/// Derive a short, human-scannable id from a random token: keep only the
/// letters, require at least three, truncate to exactly three.
fn short_id<R: Rng>(rng: &mut R) -> Option<String> {
    let token: String = rng
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let letters: Vec<char> = token
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if letters.len() < 3 {
        return None;
    }
    Some(letters[..3].iter().collect())
}

/// Manages the set of worker processes: checkout via [`take`](Pool::take) and
/// [`give`](Pool::give), debounced scale passes to hold the idle buffer at
/// `min_available_count`, and ordered teardown via [`destroy`](Pool::destroy).
pub struct Pool {
    config: Config,
    weak_self: Weak<Pool>,
    inner: Mutex<PoolState>,
}

impl Pool {
    /// Build a pool from configuration. Invalid combinations are rejected
    /// here, before anything is spawned.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            weak_self: weak_self.clone(),
            inner: Mutex::new(PoolState::default()),
        }))
    }

    /// Spawn the initial `min_pool_size` workers, one at a time.
    pub async fn init(&self) -> Result<()> {
        for _ in 0..self.config.min_pool_size {
            self.create_worker(WorkerState::Available)
                .await
                .context("Failed to start initial worker")?;
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock().unwrap();
        let mut stats = PoolStats {
            total: state.workers.len(),
            ..Default::default()
        };
        for worker in state.workers.values() {
            match worker.state {
                WorkerState::Available => stats.available += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Stopping => stats.stopping += 1,
            }
        }
        stats
    }

    /// Check out a worker: hand over an idle one, or create a fresh worker
    /// on demand so the call never waits behind a scale-up pass. The startup
    /// latency of the on-demand path lands on this caller alone.
    pub async fn take(&self) -> Result<String, PoolError> {
        let picked = {
            let mut state = self.inner.lock().unwrap();
            if state.destroyed {
                return Err(PoolError::Destroyed);
            }
            let picked = state.pick_available();
            if let Some(id) = &picked {
                state.workers.get_mut(id).unwrap().state = WorkerState::Busy;
            }
            picked
        };

        let id = match picked {
            Some(id) => {
                tracing::info!(worker = %id, "Checked out worker");
                id
            }
            None => {
                tracing::info!("No available worker, creating one on demand");
                self.create_worker(WorkerState::Busy).await?
            }
        };

        // fresh read: availability may have shifted during the creation
        let buffer_low = {
            let state = self.inner.lock().unwrap();
            !state.destroyed && state.available_count() < self.config.min_available_count
        };
        if buffer_low {
            self.schedule_increase();
        }

        Ok(id)
    }

    /// Return a worker after use. With single-use recycling the worker is
    /// destroyed and, if the idle buffer is short, replaced by a fresh one.
    /// Returning an unknown or already-idle worker is a caller bug and
    /// reports failure rather than being silently tolerated.
    pub async fn give(&self, id: &str) -> bool {
        {
            let mut state = self.inner.lock().unwrap();
            if state.destroyed {
                tracing::warn!(worker = %id, "Worker returned after pool destruction");
                return false;
            }
            match state.workers.get_mut(id) {
                None => {
                    tracing::error!(worker = %id, "Returned worker is not tracked");
                    return false;
                }
                Some(worker) => match worker.state {
                    WorkerState::Available => {
                        tracing::error!(worker = %id, "Returned worker is already available");
                        return false;
                    }
                    WorkerState::Stopping => {
                        tracing::error!(worker = %id, "Returned worker is already stopping");
                        return false;
                    }
                    WorkerState::Busy => {
                        if !self.config.single_use {
                            worker.state = WorkerState::Available;
                            tracing::info!(worker = %id, "Returned worker to the idle set");
                        }
                    }
                },
            }
        }

        if self.config.single_use {
            tracing::info!(worker = %id, "Single-use enabled, recycling worker");
            self.remove_worker(id, false).await;
            let buffer_low = {
                let state = self.inner.lock().unwrap();
                !state.destroyed && state.available_count() < self.config.min_available_count
            };
            if buffer_low {
                tracing::info!("Creating replacement for recycled worker");
                if let Err(error) = self.create_worker(WorkerState::Available).await {
                    tracing::error!(%error, "Failed to create replacement worker");
                }
            } else {
                tracing::debug!("Idle buffer is full, not replacing recycled worker");
            }
        }

        let surplus = {
            let state = self.inner.lock().unwrap();
            !state.destroyed && state.available_count() > self.config.min_available_count
        };
        if surplus {
            self.schedule_cull();
        }

        true
    }

    /// Tear the pool down. Workers are stopped one at a time and each
    /// removal waits for the process exit before the next begins: concurrent
    /// shutdown of workers sharing a lock file can wedge one of them on an
    /// interactive prompt, after which even the stop command is ignored.
    pub async fn destroy(&self) {
        let ids = {
            let mut state = self.inner.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            if let Some(timer) = state.increase_timer.take() {
                timer.abort();
            }
            if let Some(timer) = state.cull_timer.take() {
                timer.abort();
            }
            state.workers.keys().cloned().collect::<Vec<_>>()
        };
        tracing::info!(count = ids.len(), "Destroying pool");
        for id in ids {
            self.remove_worker(&id, true).await;
        }
        tracing::info!("Pool destroyed");
    }

    async fn create_worker(&self, initial: WorkerState) -> Result<String, PoolError> {
        let id = {
            let mut state = self.inner.lock().unwrap();
            if state.destroyed {
                return Err(PoolError::Destroyed);
            }
            state.reserve_id()
        };
        tracing::info!(worker = %id, "Creating worker process");

        let started = match worker::start(&self.config.worker, &id).await {
            Ok(started) => started,
            Err(error) => {
                self.inner.lock().unwrap().pending.remove(&id);
                tracing::error!(worker = %id, %error, "Worker failed to start");
                return Err(error);
            }
        };

        // The ready marker precedes actual availability of the worker's own
        // communication channel by a short interval.
        tokio::time::sleep(Duration::from_millis(self.config.worker.settle_ms)).await;

        let Started {
            mut child,
            pid,
            lines,
            readers,
        } = started;
        let (exited_tx, exited_rx) = watch::channel(false);
        let (force_tx, force_rx) = oneshot::channel();
        {
            let mut state = self.inner.lock().unwrap();
            state.pending.remove(&id);
            if state.destroyed {
                drop(state);
                tracing::warn!(worker = %id, "Pool destroyed during worker startup, discarding");
                for reader in readers {
                    reader.abort();
                }
                tokio::spawn(async move {
                    let _ = child.kill().await;
                });
                return Err(PoolError::Destroyed);
            }
            let mut forwarders = readers;
            forwarders.push(worker::forward_output(id.clone(), lines));
            state.workers.insert(
                id.clone(),
                Worker {
                    state: initial,
                    pid,
                    force_kill: Some(force_tx),
                    exited: exited_rx,
                    forwarders,
                },
            );
        }
        tokio::spawn(supervise(
            self.weak_self.clone(),
            id.clone(),
            child,
            force_rx,
            exited_tx,
        ));
        tracing::info!(worker = %id, pid = ?pid, "Worker ready");
        Ok(id)
    }

    /// Flag a worker as stopping and hand back its teardown handles.
    fn mark_stopping(&self, id: &str) -> Option<StopHandles> {
        let mut state = self.inner.lock().unwrap();
        let Some(worker) = state.workers.get_mut(id) else {
            tracing::error!(worker = %id, "Worker targeted for removal is not tracked");
            return None;
        };
        let was_stopping = worker.state == WorkerState::Stopping;
        if worker.state == WorkerState::Busy {
            tracing::debug!(worker = %id, "Removing a worker that is still checked out");
        }
        worker.state = WorkerState::Stopping;
        Some(StopHandles {
            force_kill: worker.force_kill.take(),
            exited: worker.exited.clone(),
            was_stopping,
        })
    }

    /// Remove a worker via the kill protocol. With `wait` the call returns
    /// only once the process exit has been observed; without it the
    /// supervision task finishes the removal in the background.
    async fn remove_worker(&self, id: &str, wait: bool) -> bool {
        let Some(handles) = self.mark_stopping(id) else {
            return false;
        };
        self.stop_worker(id, handles, wait).await
    }

    async fn stop_worker(&self, id: &str, handles: StopHandles, wait: bool) -> bool {
        let StopHandles {
            force_kill,
            mut exited,
            was_stopping,
        } = handles;

        if !was_stopping {
            tracing::info!(worker = %id, "Stopping worker");
            if !self.issue_graceful_stop(id).await {
                let mut state = self.inner.lock().unwrap();
                if let Some(worker) = state.workers.get_mut(id) {
                    worker.force_kill = force_kill;
                }
                return false;
            }
            // The pipes are no longer needed once the stop is underway.
            {
                let state = self.inner.lock().unwrap();
                if let Some(worker) = state.workers.get(id) {
                    for task in &worker.forwarders {
                        task.abort();
                    }
                }
            }
            if let Some(force) = force_kill {
                tokio::spawn(async move {
                    tokio::time::sleep(FORCE_KILL_DELAY).await;
                    // lands nowhere if the process already exited
                    let _ = force.send(());
                });
            }
        }

        if wait {
            if exited.wait_for(|done| *done).await.is_err() {
                tracing::warn!(worker = %id, "Exit watch closed before completion");
            } else {
                tracing::info!(worker = %id, "Worker removal complete");
            }
        }
        true
    }

    /// Ask the worker to shut itself down via the attach client. Failure is
    /// reported but deliberately not escalated to a forced kill: the worker
    /// may be mid-write, and killing it here trades a possible zombie for
    /// possible data loss.
    async fn issue_graceful_stop(&self, id: &str) -> bool {
        let args = render_args(&self.config.attach.stop_args, id);
        match Command::new(&self.config.attach.command)
            .args(&args)
            .output()
            .await
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                tracing::warn!(
                    worker = %id,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                    "Stop command failed"
                );
                false
            }
            Err(error) => {
                tracing::warn!(worker = %id, %error, "Could not run stop command");
                false
            }
        }
    }

    /// Reconcile an observed process exit: the worker leaves the tracked set
    /// here and nowhere else, whatever caused the exit.
    fn reap(&self, id: &str) {
        let mut state = self.inner.lock().unwrap();
        match state.workers.remove(id) {
            Some(worker) => {
                for task in &worker.forwarders {
                    task.abort();
                }
                tracing::info!(worker = %id, pid = ?worker.pid, "Worker removed from pool");
            }
            None => tracing::error!(worker = %id, "Exited worker was already removed"),
        }
    }

    /// Collapse bursts of scale-up requests into one pass per window.
    fn schedule_increase(&self) {
        let mut state = self.inner.lock().unwrap();
        if state.destroyed {
            return;
        }
        if let Some(timer) = state.increase_timer.take() {
            timer.abort();
        }
        let pool = self.weak_self.clone();
        state.increase_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(INCREASE_DEBOUNCE).await;
            if let Some(pool) = pool.upgrade() {
                pool.inner.lock().unwrap().increase_timer = None;
                pool.increase().await;
            }
        }));
    }

    fn schedule_cull(&self) {
        let mut state = self.inner.lock().unwrap();
        if state.destroyed {
            return;
        }
        if let Some(timer) = state.cull_timer.take() {
            timer.abort();
        }
        let pool = self.weak_self.clone();
        state.cull_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(CULL_DEBOUNCE).await;
            if let Some(pool) = pool.upgrade() {
                pool.inner.lock().unwrap().cull_timer = None;
                pool.cull().await;
            }
        }));
    }

    /// Create idle workers until the buffer is restored. Re-entry is a no-op
    /// while a pass is already running.
    async fn increase(&self) {
        {
            let mut state = self.inner.lock().unwrap();
            if state.destroyed || state.increasing {
                return;
            }
            state.increasing = true;
        }
        tracing::info!("Increasing pool size");
        let mut added = 0usize;
        loop {
            {
                let state = self.inner.lock().unwrap();
                if state.destroyed || state.available_count() >= self.config.min_available_count {
                    break;
                }
            }
            match self.create_worker(WorkerState::Available).await {
                Ok(_) => added += 1,
                Err(error) => {
                    tracing::error!(%error, "Failed to create worker during increase pass");
                    break;
                }
            }
        }
        tracing::info!(added, "Increase pass complete");
        self.inner.lock().unwrap().increasing = false;
    }

    /// Remove surplus idle workers. The surplus is re-evaluated from scratch
    /// every iteration: a concurrent take can consume a worker this pass had
    /// not yet acted on, and the claim happens under the same lock as the
    /// check so a racing take can never be handed a stopping worker.
    async fn cull(&self) {
        {
            let mut state = self.inner.lock().unwrap();
            if state.destroyed || state.culling {
                return;
            }
            state.culling = true;
        }
        tracing::info!("Removing surplus workers");
        let mut removed = 0usize;
        loop {
            let candidate = {
                let mut state = self.inner.lock().unwrap();
                if state.destroyed {
                    None
                } else {
                    let surplus = state
                        .available_count()
                        .saturating_sub(self.config.min_available_count);
                    if surplus > 0 && state.workers.len() > self.config.min_pool_size {
                        state.pick_available().map(|id| {
                            let worker = state.workers.get_mut(&id).unwrap();
                            worker.state = WorkerState::Stopping;
                            let handles = StopHandles {
                                force_kill: worker.force_kill.take(),
                                exited: worker.exited.clone(),
                                was_stopping: false,
                            };
                            (id, handles)
                        })
                    } else {
                        None
                    }
                }
            };
            match candidate {
                Some((id, handles)) => {
                    self.stop_worker(&id, handles, false).await;
                    removed += 1;
                }
                None => break,
            }
        }
        tracing::info!(removed, "Cull pass complete");
        self.inner.lock().unwrap().culling = false;
    }
}

/// Owns the child process of a tracked worker: waits for exit, applies the
/// forced kill if the escalation timer fires, and reconciles the pool.
async fn supervise(
    pool: Weak<Pool>,
    id: String,
    mut child: Child,
    mut force_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        force = &mut force_rx => {
            if force.is_ok() {
                tracing::warn!(worker = %id, "Worker did not stop in time, killing process");
                if let Err(error) = child.start_kill() {
                    tracing::warn!(worker = %id, %error, "Failed to kill worker process");
                }
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => tracing::info!(worker = %id, %status, "Worker process exited"),
        Err(error) => tracing::warn!(worker = %id, %error, "Failed waiting on worker process"),
    }
    if let Some(pool) = pool.upgrade() {
        pool.reap(&id);
    }
    let _ = exited_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn short_ids_are_three_lowercase_letters() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut produced = 0;
        for _ in 0..200 {
            if let Some(id) = short_id(&mut rng) {
                assert_eq!(id.len(), 3);
                assert!(id.chars().all(|c| c.is_ascii_lowercase()));
                produced += 1;
            }
        }
        assert!(produced > 0, "seeded rng never produced a usable id");
    }

    #[test]
    fn reserved_ids_do_not_collide() {
        let mut state = PoolState::default();
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let id = state.reserve_id();
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn pool_rejects_invalid_configuration() {
        let config = Config {
            min_pool_size: 1,
            min_available_count: 2,
            ..Config::default()
        };
        assert!(Pool::new(config).is_err());
    }
}
