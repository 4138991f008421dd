//! dirmirror - keep a remote copy of a local directory up to date
//!
//! Watches a directory, coalesces bursts of filesystem events and mirrors the
//! net changes to a remote store with bounded parallelism and retries.

mod display;
mod logging;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use console::style;
use dialoguer::Confirm;
use dirmirror_config::{ConfigLoader, LoggingConfig, LOG_LEVELS};
use dirmirror_engine::{credentials_from_config, transport_from_config, MirrorEngine};
use dirmirror_session::{MemoryTransport, RemoteTransport};
use dirmirror_types::NoopSink;
use logging::LogOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// dirmirror - mirror a local directory to a remote store as it changes
#[derive(Parser)]
#[command(
    name = "dirmirror",
    version = env!("CARGO_PKG_VERSION"),
    about = "Mirror a local directory to a remote store as it changes",
    long_about = "dirmirror watches a local directory and keeps a remote copy up to date.\n\
                  Bursts of changes to a file are coalesced into one upload or delete,\n\
                  and failed transfers are retried with backoff."
)]
struct Cli {
    /// Log level
    #[arg(long, global = true, value_parser = LOG_LEVELS)]
    loglevel: Option<String>,

    /// Log to an automatically named file in the working directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    logfile: bool,

    /// Log to the given file
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start mirroring
    Start {
        /// Mirror into an in-memory store instead of the configured remote
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect or create configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the version
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a configuration template
    Generate {
        /// Where to write the template; the extension picks the format
        path: PathBuf,
        /// Overwrite without asking
        #[arg(long)]
        force: bool,
    },
    /// Check a configuration file
    Validate {
        /// File to check, defaults to the first one found
        path: Option<PathBuf>,
    },
}

impl Cli {
    fn log_options(&self, config: &LoggingConfig) -> LogOptions {
        LogOptions::resolve(
            self.loglevel.as_deref(),
            self.logfile,
            self.log_file.as_deref(),
            self.json_logs,
            self.quiet,
            config,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    let command = match cli.command.take() {
        Some(command) => command,
        None if cli.config.is_some() || ConfigLoader::config_exists().is_some() => {
            Commands::Start { dry_run: false }
        }
        None => {
            Cli::command().print_help()?;
            println!();
            display::display_info(
                "No configuration found, create one with `dirmirror config generate dirmirror.yaml`",
            );
            return Ok(());
        }
    };

    match command {
        Commands::Start { dry_run } => start_command(&cli, dry_run).await,
        Commands::Config { action } => config_command(&cli, action),
        Commands::Version => {
            println!("dirmirror {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_command(cli: &Cli, dry_run: bool) -> Result<()> {
    let config =
        ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = logging::init(&cli.log_options(&config.logging))?;

    info!("dirmirror v{} starting", env!("CARGO_PKG_VERSION"));

    let credentials = credentials_from_config(&config)?;
    let transport: Arc<dyn RemoteTransport> = if dry_run {
        Arc::new(MemoryTransport::new())
    } else {
        transport_from_config(&config, &credentials)?
    };
    let grace = config.shutdown_grace();

    if !cli.quiet {
        println!(
            "{} Mirroring {} to {}",
            style("→").green().bold(),
            style(config.watch_root.display()).cyan(),
            style(&config.remote_root).cyan()
        );
        if dry_run {
            display::display_info("Dry run - changes go to an in-memory store");
        }
    }

    let handle = MirrorEngine::start(config, transport, credentials, Arc::new(NoopSink))
        .await
        .context("failed to start mirroring")?;

    let spinner = display::create_status_spinner(cli.quiet);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let failure = {
        let ctrl_c = tokio::signal::ctrl_c();
        let watch_failure = handle.watch_failure();
        tokio::pin!(ctrl_c, watch_failure);
        loop {
            tokio::select! {
                signal = &mut ctrl_c => {
                    signal.context("failed to listen for Ctrl-C")?;
                    break None;
                }
                failure = &mut watch_failure => break failure,
                _ = ticker.tick() => {
                    if let Some(pb) = &spinner {
                        pb.set_message(display::status_line(
                            &handle.snapshot(),
                            &handle.statistics(),
                            handle.connection_state(),
                        ));
                    }
                }
            }
        }
    };

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    if !cli.quiet {
        display::display_info("Stopping, waiting for in-flight operations...");
    }

    let report = handle.shutdown(grace).await;
    if !cli.quiet {
        display::display_summary(&report);
    }

    if let Some(error) = failure {
        display::display_error(&format!("Watching stopped: {}", error));
        return Err(anyhow::Error::new(error).context("watch failed"));
    }
    Ok(())
}

fn config_command(cli: &Cli, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = ConfigLoader::load(cli.config.as_deref())
                .context("failed to load configuration")?;
            println!("{} Current configuration:", style("⚙").blue().bold());
            print!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigAction::Generate { path, force } => {
            if path.exists() && !force {
                let overwrite = Confirm::new()
                    .with_prompt(format!("{} already exists. Overwrite?", path.display()))
                    .default(false)
                    .interact()?;
                if !overwrite {
                    display::display_info("Left the existing file untouched");
                    return Ok(());
                }
            }
            ConfigLoader::generate_default_config(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            display::display_success(&format!("Wrote configuration template to {}", path.display()));
        }
        ConfigAction::Validate { path } => {
            let Some(path) = path
                .or_else(|| cli.config.clone())
                .or_else(ConfigLoader::config_exists)
            else {
                bail!("no configuration file found");
            };
            ConfigLoader::validate_file(&path)
                .with_context(|| format!("{} is not valid", path.display()))?;
            display::display_success(&format!("{} is valid", path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "dirmirror",
            "start",
            "--dry-run",
            "--loglevel",
            "debug",
            "-c",
            "mirror.yaml",
        ]);
        assert_eq!(cli.loglevel.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("mirror.yaml")));
        assert!(matches!(cli.command, Some(Commands::Start { dry_run: true })));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["dirmirror", "--loglevel", "loud", "version"]).is_err());
    }

    #[test]
    fn test_logfile_conflicts_with_log_file() {
        assert!(Cli::try_parse_from(["dirmirror", "--logfile", "--log-file", "x.log", "version"])
            .is_err());
    }
}
