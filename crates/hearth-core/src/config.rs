// ABOUTME: Configuration for the hearth broker and client
// ABOUTME: Loaded from TOML with defaults matching the stock Emacs daemon protocol

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration shared by `hearthd` and `hearth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unix socket the broker listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Workers kept alive at all times
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,

    /// Idle workers kept ready for immediate checkout. Must not exceed
    /// `min_pool_size`.
    #[serde(default = "default_min_available")]
    pub min_available_count: usize,

    /// Destroy and respawn a worker after each use instead of returning it
    /// to the idle set. Workers accumulate in-process state across uses;
    /// recycling guarantees each client a clean slate.
    #[serde(default = "default_single_use")]
    pub single_use: bool,

    /// Debug logging
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub attach: AttachConfig,
}

/// How to start a worker process and recognize that it is ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Arguments for the worker; `{id}` is replaced with the worker's id
    #[serde(default = "default_spawn_args")]
    pub spawn_args: Vec<String>,

    /// Literal text the worker prints once it is up
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// Delay between the ready marker and actual availability of the
    /// worker's own socket, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

/// How to attach to a worker and how to ask it to stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachConfig {
    /// Attach client executable
    #[serde(default = "default_attach_command")]
    pub command: String,

    /// Arguments selecting the worker to attach to; `{id}` is replaced with
    /// the worker's id. Pass-through arguments are appended after these.
    #[serde(default = "default_attach_args")]
    pub attach_args: Vec<String>,

    /// Arguments that make the attach client ask the worker to shut itself
    /// down; `{id}` is replaced with the worker's id
    #[serde(default = "default_stop_args")]
    pub stop_args: Vec<String>,
}

fn default_socket_path() -> String {
    "~/.config/hearth/hearth.sock".to_string()
}

fn default_min_pool_size() -> usize {
    4
}

fn default_min_available() -> usize {
    4
}

fn default_single_use() -> bool {
    true
}

fn default_worker_command() -> String {
    "emacs".to_string()
}

fn default_spawn_args() -> Vec<String> {
    vec!["--fg-daemon={id}".to_string()]
}

fn default_ready_marker() -> String {
    "Starting Emacs daemon.".to_string()
}

fn default_settle_ms() -> u64 {
    250
}

fn default_attach_command() -> String {
    "emacsclient".to_string()
}

fn default_attach_args() -> Vec<String> {
    vec!["--socket-name={id}".to_string()]
}

fn default_stop_args() -> Vec<String> {
    vec![
        "-s".to_string(),
        "{id}".to_string(),
        "-e".to_string(),
        "(kill-emacs)".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            min_pool_size: default_min_pool_size(),
            min_available_count: default_min_available(),
            single_use: default_single_use(),
            debug: false,
            worker: WorkerConfig::default(),
            attach: AttachConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            spawn_args: default_spawn_args(),
            ready_marker: default_ready_marker(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            command: default_attach_command(),
            attach_args: default_attach_args(),
            stop_args: default_stop_args(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load config from the given path, or from the default location if it
    /// exists, or fall back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Get the default config file path (~/.config/hearth/config.toml)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("hearth");
        Ok(config_dir.join("config.toml"))
    }

    /// Reject invalid option combinations before anything starts
    pub fn validate(&self) -> Result<()> {
        if self.min_pool_size < 1 {
            bail!("Minimum pool size must be at least 1");
        }
        if self.min_available_count < 1 {
            bail!("Minimum available count must be at least 1");
        }
        if self.min_available_count > self.min_pool_size {
            bail!("Minimum pool size must be at least the minimum available count");
        }
        if self.worker.command.is_empty() {
            bail!("No worker command configured");
        }
        if self.attach.command.is_empty() {
            bail!("No attach command configured");
        }
        Ok(())
    }

    /// Expand `~` in the socket path
    pub fn socket_path_expanded(&self) -> PathBuf {
        shellexpand::tilde(&self.socket_path).into_owned().into()
    }
}

/// Substitute the worker id into an argument template.
pub fn render_args(args: &[String], id: &str) -> Vec<String> {
    args.iter().map(|arg| arg.replace("{id}", id)).collect()
}
