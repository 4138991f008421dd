//! Configuration management system for dirmirror
//!
//! This crate loads the mirror configuration from layered sources and
//! validates it before any pipeline component is created.
//!
//! # Features
//!
//! - **Multiple formats**: YAML, TOML and JSON configuration files
//! - **Validation**: every value is range-checked once, at load time
//! - **Environment overrides**: `DIRMIRROR__SECTION__KEY` variables win over files
//! - **Defaults**: sensible default values for all tuning options
//!
//! # Examples
//!
//! ```rust,no_run
//! use dirmirror_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("dirmirror.yaml")
//!     .add_env_prefix("DIRMIRROR")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Mirroring {} to {}", config.watch_root.display(), config.remote_root);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use dirmirror_types::{DebounceWindow, RetryConfig, WorkerCount};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DIRMIRROR";

/// Log levels accepted by `logging.level`
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Ignore patterns covering common editor and OS temp files
pub const DEFAULT_IGNORE_PATTERNS: [&str; 8] = [
    "*.swp",
    "*.swx",
    "*~",
    "*.tmp",
    ".#*",
    "4913",
    ".DS_Store",
    "Thumbs.db",
];

/// Main configuration structure for dirmirror
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Absolute path of the local directory to mirror
    pub watch_root: PathBuf,
    /// Root of the mirror on the remote side
    pub remote_root: String,
    /// Remote endpoint configuration
    pub remote: RemoteConfig,
    /// Pipeline tuning
    pub sync: SyncConfig,
    /// Retry policy for remote operations
    pub retry: RetrySettings,
    /// Paths excluded from mirroring
    pub ignore: IgnoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// A starting point for a new configuration file
    pub fn template() -> Self {
        Self {
            watch_root: PathBuf::from("/path/to/local/folder"),
            remote_root: "/path/to/remote/folder".to_string(),
            ..Self::default()
        }
    }

    /// Validated debounce window
    pub fn debounce_window(&self) -> ConfigResult<DebounceWindow> {
        DebounceWindow::from_millis(self.sync.debounce_window_ms)
            .map_err(|e| ConfigError::invalid_value("sync.debounce_window_ms", e))
    }

    /// Validated worker pool size
    pub fn worker_count(&self) -> ConfigResult<WorkerCount> {
        WorkerCount::new(self.sync.worker_count)
            .map_err(|e| ConfigError::invalid_value("sync.worker_count", e))
    }

    /// Validated retry configuration
    pub fn retry_config(&self) -> ConfigResult<RetryConfig> {
        RetryConfig::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.backoff_base_ms),
            Duration::from_millis(self.retry.backoff_cap_ms),
            self.retry.jitter,
        )
        .map_err(|e| ConfigError::invalid_value("retry", e))
    }

    /// Grace period granted to in-flight operations at shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.sync.shutdown_grace_ms)
    }
}

/// Transport used to reach the remote store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A directory on a local or mounted filesystem
    #[default]
    Local,
    /// A host reachable through the system `ssh` client
    Ssh,
    /// A host reached over SFTP, logging in with a password, key or agent
    Sftp,
    /// An in-process store, nothing leaves the machine
    Memory,
}

/// Remote endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Transport kind
    pub transport: TransportKind,
    /// Remote host name, required for ssh and sftp
    pub host: Option<String>,
    /// Remote port
    pub port: u16,
    /// Remote user name, required for ssh and sftp
    pub username: Option<String>,
    /// Private key passed to ssh
    pub identity_file: Option<PathBuf>,
    /// Timeout for establishing a connection
    pub connect_timeout_ms: u64,
    /// Timeout for a single remote operation
    pub operation_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Local,
            host: None,
            port: 22,
            username: None,
            identity_file: None,
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 60_000,
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period per path before its intent is released
    pub debounce_window_ms: u64,
    /// Number of dispatcher workers
    pub worker_count: usize,
    /// Capacity of the channels between pipeline stages
    pub queue_capacity: usize,
    /// Mirror files that already exist when the engine starts
    pub initial_sync: bool,
    /// Release pending intents at shutdown instead of dropping them
    pub flush_on_shutdown: bool,
    /// Grace period for in-flight operations at shutdown
    pub shutdown_grace_ms: u64,
    /// Skip uploads whose content matches the last successful upload
    pub skip_unchanged: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 500,
            worker_count: WorkerCount::DEFAULT,
            queue_capacity: 1024,
            initial_sync: true,
            flush_on_shutdown: true,
            shutdown_grace_ms: 10_000,
            skip_unchanged: true,
        }
    }
}

/// Retry policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts per operation, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff_base_ms: u64,
    /// Upper bound of any single delay
    pub backoff_cap_ms: u64,
    /// Relative jitter, in `[0, 1)`
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff_base_ms: defaults.base_delay.as_millis() as u64,
            backoff_cap_ms: defaults.max_delay.as_millis() as u64,
            jitter: defaults.jitter,
        }
    }
}

/// Ignore configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Glob patterns matched against path components and relative paths
    pub patterns: Vec<String>,
    /// Skip entries whose name starts with a dot
    pub ignore_hidden: bool,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            ignore_hidden: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path
    pub log_file: Option<PathBuf>,
    /// Enable JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
            json_format: false,
        }
    }
}
