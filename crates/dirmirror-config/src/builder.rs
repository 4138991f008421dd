//! Configuration builder for layered configuration loading

use crate::{Config, ConfigError, ConfigResult, TransportKind, LOG_LEVELS};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Configuration builder for loading configuration from multiple sources
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source, format detected from the extension
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add a configuration file source with explicit format
    pub fn add_source_file_with_format<P: AsRef<Path>>(
        mut self,
        path: P,
        format: FileFormat,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        // Serialized defaults form the base layer
        let defaults_value = serde_yaml::to_value(Config::default())
            .map_err(|e| ConfigError::serialization(format!("Failed to serialize defaults: {}", e)))?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix)
                            .separator(&self.env_separator)
                            .try_parsing(true),
                    );
                }
                ConfigSource::Defaults => {}
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        Self::validate(&result)?;

        Ok(result)
    }

    /// Detect file format from extension
    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }

    /// Validate the configuration
    ///
    /// Checks are purely syntactic; whether `watch_root` exists is decided
    /// when the engine starts.
    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.watch_root.as_os_str().is_empty() {
            return Err(ConfigError::missing_required("watch_root"));
        }
        if !config.watch_root.is_absolute() {
            return Err(ConfigError::invalid_value(
                "watch_root",
                format!("'{}' must be an absolute path", config.watch_root.display()),
            ));
        }
        if config.remote_root.trim().is_empty() {
            return Err(ConfigError::missing_required("remote_root"));
        }

        if matches!(config.remote.transport, TransportKind::Ssh | TransportKind::Sftp) {
            if config.remote.host.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::missing_required("remote.host"));
            }
            if config.remote.username.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::missing_required("remote.username"));
            }
        }
        if config.remote.port == 0 {
            return Err(ConfigError::invalid_value(
                "remote.port",
                "Port must be greater than 0",
            ));
        }

        config.debounce_window()?;
        config.worker_count()?;
        config.retry_config()?;

        if config.sync.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "sync.queue_capacity",
                "Queue capacity must be greater than 0",
            ));
        }

        if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        for pattern in &config.ignore.patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                ConfigError::invalid_value("ignore.patterns", format!("'{}': {}", pattern, e))
            })?;
        }

        Ok(())
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
