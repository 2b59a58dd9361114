//! Configuration module for the worker.
//!
//! Two sources feed the final configuration:
//! - command-line arguments, parsed at startup;
//! - the application config file (TOML), read only once the heartbeat is
//!   established so that a broken file is reported to the parent.
//!
//! CLI arguments take precedence over config file values.

use crate::app::builder::MountConfig;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the worker
#[derive(Parser, Debug, Clone)]
#[command(name = "netstring-worker")]
#[command(version = "0.1.0")]
#[command(about = "Serve netstring-framed requests on a Unix socket", long_about = None)]
pub struct CliArgs {
    /// Path of the Unix socket to listen on
    #[arg(short, long)]
    pub file: PathBuf,

    /// Application config file (TOML)
    pub config: PathBuf,

    /// How long to wait for the parent's heartbeat connection, in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub heartbeat_timeout_ms: u64,

    /// Readiness wait timeout, in seconds
    #[arg(long, default_value_t = 60)]
    pub poll_timeout_secs: u64,

    /// Bytes requested per client read
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Maximum buffered request size per connection
    #[arg(long)]
    pub max_request_bytes: Option<usize>,

    /// Maximum buffered request bytes across all connections
    #[arg(long)]
    pub max_buffered_bytes: Option<usize>,

    /// Maximum encoded response body size
    #[arg(long)]
    pub max_response_bytes: Option<usize>,

    /// Maximum number of open client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Application config file structure
#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default, rename = "mount")]
    pub mounts: Vec<MountConfig>,
}

/// Worker limits from the `[worker]` table
#[derive(Debug, Deserialize, Default)]
pub struct WorkerConfig {
    pub read_chunk_size: Option<usize>,
    pub max_request_bytes: Option<usize>,
    pub max_buffered_bytes: Option<usize>,
    pub max_response_bytes: Option<usize>,
    pub max_connections: Option<usize>,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Resource limits applied by the reactor and request handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub read_chunk_size: usize,
    pub max_request_bytes: usize,
    pub max_buffered_bytes: usize,
    pub max_response_bytes: usize,
    pub max_connections: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            read_chunk_size: 16 * 1024,
            max_request_bytes: 64 * 1024 * 1024,   // 64 MB
            max_buffered_bytes: 256 * 1024 * 1024, // 256 MB
            max_response_bytes: 64 * 1024 * 1024,  // 64 MB
            max_connections: 1024,
        }
    }
}

/// Final resolved startup configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub app_config: PathBuf,
    pub heartbeat_timeout: Duration,
    pub poll_timeout: Duration,
    pub log_level: String,
    cli: CliArgs,
}

impl Config {
    /// Load configuration from CLI args.
    pub fn load() -> Self {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Self {
        Config {
            socket_path: cli.file.clone(),
            app_config: cli.config.clone(),
            heartbeat_timeout: Duration::from_millis(cli.heartbeat_timeout_ms),
            poll_timeout: Duration::from_secs(cli.poll_timeout_secs),
            log_level: cli.log_level.clone(),
            cli,
        }
    }

    /// Merge limits: CLI, then the `[worker]` table, then defaults.
    pub fn limits(&self, file: &WorkerConfig) -> Limits {
        let defaults = Limits::default();
        let cli = &self.cli;
        Limits {
            read_chunk_size: cli
                .read_chunk_size
                .or(file.read_chunk_size)
                .unwrap_or(defaults.read_chunk_size)
                .max(1),
            max_request_bytes: cli
                .max_request_bytes
                .or(file.max_request_bytes)
                .unwrap_or(defaults.max_request_bytes),
            max_buffered_bytes: cli
                .max_buffered_bytes
                .or(file.max_buffered_bytes)
                .unwrap_or(defaults.max_buffered_bytes),
            max_response_bytes: cli
                .max_response_bytes
                .or(file.max_response_bytes)
                .unwrap_or(defaults.max_response_bytes),
            max_connections: cli
                .max_connections
                .or(file.max_connections)
                .unwrap_or(defaults.max_connections),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid mount '{0}': {1}")]
    InvalidMount(String, &'static str),
    #[error("No applications mounted")]
    NoMounts,
}
