// ABOUTME: Process-level tests for the worker pool using shell-script workers
// ABOUTME: Covers checkout, recycling, scale passes, and teardown

use hearth_core::{AttachConfig, Config, Pool, PoolError, WorkerConfig};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Stand-in worker: records its pid next to the script, prints a ready line,
/// then sleeps. The stop script terminates the recorded pid, which is the
/// whole graceful-stop protocol as far as these tests are concerned.
fn fixture_config(
    dir: &TempDir,
    min_pool_size: usize,
    min_available_count: usize,
    single_use: bool,
) -> Config {
    let worker = dir.path().join("worker.sh");
    write_script(
        &worker,
        "#!/bin/sh\necho $$ > \"$(dirname \"$0\")/$1.pid\"\necho \"worker $1 ready\"\nexec sleep 60\n",
    );
    let stop = dir.path().join("stop.sh");
    write_script(
        &stop,
        "#!/bin/sh\nexec kill \"$(cat \"$(dirname \"$0\")/$1.pid\")\"\n",
    );
    Config {
        min_pool_size,
        min_available_count,
        single_use,
        worker: WorkerConfig {
            command: worker.to_string_lossy().into_owned(),
            spawn_args: vec!["{id}".to_string()],
            ready_marker: "ready".to_string(),
            settle_ms: 10,
        },
        attach: AttachConfig {
            command: stop.to_string_lossy().into_owned(),
            stop_args: vec!["{id}".to_string()],
            ..AttachConfig::default()
        },
        ..Config::default()
    }
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn take_marks_busy_and_give_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, false)).unwrap();
    pool.init().await.unwrap();
    assert_eq!(pool.stats().available, 1);

    let id = pool.take().await.unwrap();
    let stats = pool.stats();
    assert_eq!((stats.available, stats.busy), (0, 1));

    assert!(pool.give(&id).await);
    let stats = pool.stats();
    assert_eq!((stats.available, stats.busy), (1, 0));

    pool.destroy().await;
}

#[tokio::test]
async fn double_give_reports_failure_and_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, false)).unwrap();
    pool.init().await.unwrap();

    let id = pool.take().await.unwrap();
    assert!(pool.give(&id).await);
    let before = pool.stats();
    assert!(!pool.give(&id).await);
    assert_eq!(pool.stats(), before);

    pool.destroy().await;
}

#[tokio::test]
async fn giving_an_unknown_worker_fails() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, false)).unwrap();
    pool.init().await.unwrap();

    assert!(!pool.give("zzz").await);
    assert_eq!(pool.stats().total, 1);

    pool.destroy().await;
}

#[tokio::test]
async fn take_creates_on_demand_when_idle_set_is_empty() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, false)).unwrap();
    pool.init().await.unwrap();

    let first = pool.take().await.unwrap();
    // the idle set is now empty; this take pays for a fresh worker itself
    let second = pool.take().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(pool.stats().busy, 2);

    pool.destroy().await;
}

#[tokio::test]
async fn destroyed_pool_rejects_take_and_give() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, false)).unwrap();
    pool.init().await.unwrap();

    let id = pool.take().await.unwrap();
    pool.destroy().await;
    assert_eq!(pool.stats().total, 0);

    assert!(matches!(pool.take().await, Err(PoolError::Destroyed)));
    assert!(!pool.give(&id).await);
}

#[tokio::test]
async fn single_use_never_returns_the_same_worker_to_the_idle_set() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, true)).unwrap();
    pool.init().await.unwrap();

    let first = pool.take().await.unwrap();
    assert!(pool.give(&first).await);
    // the recycled worker is gone for good
    assert!(!pool.give(&first).await);

    // a replacement keeps the buffer stocked, under a different id
    wait_until("replacement worker", Duration::from_secs(5), || {
        pool.stats().available >= 1
    })
    .await;
    let second = pool.take().await.unwrap();
    assert_ne!(first, second);

    pool.destroy().await;
}

#[tokio::test]
async fn increase_restores_idle_buffer_after_takes() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 2, 1, false)).unwrap();
    pool.init().await.unwrap();
    assert_eq!(pool.stats().available, 2);

    let _a = pool.take().await.unwrap();
    let _b = pool.take().await.unwrap();
    assert_eq!(pool.stats().available, 0);

    // the debounced increase pass restores the configured buffer
    wait_until("idle buffer restored", Duration::from_secs(5), || {
        pool.stats().available == 1
    })
    .await;
    assert_eq!(pool.stats().total, 3);

    pool.destroy().await;
}

#[tokio::test]
async fn cull_removes_surplus_down_to_the_configured_buffer() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 1, 1, false)).unwrap();
    pool.init().await.unwrap();

    // three checkouts: one pooled worker plus two created on demand
    let ids = vec![
        pool.take().await.unwrap(),
        pool.take().await.unwrap(),
        pool.take().await.unwrap(),
    ];
    assert_eq!(pool.stats().busy, 3);

    // a burst of returns; the debounce window collapses these into a single
    // cull pass once things quiet down
    for id in &ids {
        assert!(pool.give(id).await);
    }
    assert!(pool.stats().available >= 3);

    wait_until("surplus culled", Duration::from_secs(10), || {
        let stats = pool.stats();
        stats.total == 1 && stats.available == 1
    })
    .await;

    pool.destroy().await;
}

#[tokio::test]
async fn cull_respects_the_minimum_pool_size() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 4, 2, false)).unwrap();
    pool.init().await.unwrap();
    assert_eq!(pool.stats().available, 4);

    // three checkouts drop the idle buffer below its minimum; the increase
    // pass grows the pool to five workers
    let ids = vec![
        pool.take().await.unwrap(),
        pool.take().await.unwrap(),
        pool.take().await.unwrap(),
    ];
    wait_until("idle buffer restored", Duration::from_secs(10), || {
        let stats = pool.stats();
        stats.available == 2 && stats.total == 5
    })
    .await;

    // returning everything overshoots the buffer, but the cull may only
    // remove down to the pool floor: one worker goes, four stay idle
    for id in &ids {
        assert!(pool.give(id).await);
    }
    assert_eq!(pool.stats().available, 5);

    wait_until("cull settled", Duration::from_secs(10), || {
        let stats = pool.stats();
        stats.total == 4 && stats.available == 4
    })
    .await;

    // no further pass may dip below the floor
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.stats().total, 4);

    pool.destroy().await;
}

#[tokio::test]
async fn worker_states_always_partition_the_pool() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 2, 1, false)).unwrap();
    pool.init().await.unwrap();

    let check = |pool: &Pool| {
        let stats = pool.stats();
        assert_eq!(stats.available + stats.busy + stats.stopping, stats.total);
    };

    check(&pool);
    let a = pool.take().await.unwrap();
    check(&pool);
    let b = pool.take().await.unwrap();
    check(&pool);
    assert!(pool.give(&a).await);
    check(&pool);
    assert!(pool.give(&b).await);
    check(&pool);

    pool.destroy().await;
    check(&pool);
}

#[tokio::test]
async fn destroy_observes_every_worker_exit() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(fixture_config(&dir, 3, 3, false)).unwrap();
    pool.init().await.unwrap();
    assert_eq!(pool.stats().total, 3);

    // removal only happens once a process exit is observed, so an empty
    // pool after destroy means all three exits were seen, in sequence
    pool.destroy().await;
    assert_eq!(pool.stats(), hearth_core::PoolStats::default());
}
