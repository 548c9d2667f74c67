// ABOUTME: Core library for hearth: config, worker lifecycle, and the pool manager
// ABOUTME: Re-exports the types the broker and client binaries build on

pub mod config;
pub mod pool;
pub mod worker;

pub use config::{AttachConfig, Config, WorkerConfig};
pub use pool::{Pool, PoolError, PoolStats};

/// Literal line the broker logs once it is accepting connections. The
/// bootstrap launcher scans the broker's output for it before connecting.
pub const READY_LINE: &str = "Pool is ready.";
