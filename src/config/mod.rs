//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables, then
//! adjusted by command line flags.

mod cli;

pub use cli::Cli;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "moquette.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MOQUETTE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MOQUETTE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MOQUETTE_LOG";

use serde::Deserialize;

use crate::bus::MessagingConfig;
use crate::dispatcher::DispatcherConfig;
use crate::router::RoutesConfig;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection and subscription.
    pub messaging: MessagingConfig,
    /// Handler directory and file name separator.
    pub routes: RoutesConfig,
    /// Per-message handling.
    pub dispatcher: DispatcherConfig,
    /// Log at debug level unless `MOQUETTE_LOG` says otherwise.
    pub debug: bool,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `moquette.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
