//! Logging setup for the dirmirror binary
//!
//! Console output goes to stderr, optionally as JSON. A log file, when
//! requested, is written through a non-blocking appender whose guard must
//! live until the program exits.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use dirmirror_config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the file writer alive
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Resolved logging options, command line first, then configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl LogOptions {
    /// Merge command line flags over the configured logging section
    pub fn resolve(
        level: Option<&str>,
        auto_file: bool,
        file: Option<&Path>,
        json: bool,
        quiet: bool,
        config: &LoggingConfig,
    ) -> Self {
        let level = if quiet {
            "error".to_string()
        } else {
            level.map_or_else(|| config.level.clone(), str::to_string)
        };
        let file = if auto_file {
            Some(PathBuf::from(auto_log_file_name(Local::now())))
        } else {
            file.map(Path::to_path_buf)
                .or_else(|| config.log_file.clone())
        };

        Self {
            level,
            file,
            json: json || config.json_format,
        }
    }
}

/// `dirmirror.<version>.<dd-mm-yyyy>.<HHMM>.log`
pub fn auto_log_file_name(now: DateTime<Local>) -> String {
    format!(
        "dirmirror.{}.{}.log",
        env!("CARGO_PKG_VERSION"),
        now.format("%d-%m-%Y.%H%M")
    )
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the resolved level.
pub fn init(options: &LogOptions) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .with_context(|| format!("invalid log level '{}'", options.level))?;

    let console = (!options.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let console_json = options
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    let (file_layer, guard) = match &options.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file '{}' has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .context("failed to install the logger")?;

    Ok(LogGuard { _guard: guard })
}
