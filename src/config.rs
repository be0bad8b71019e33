//! Configuration for the switchboard binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "A RESP command-dispatch server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on: host:port for TCP, anything else is a Unix socket path
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Seconds to wait for connections to finish on shutdown
    #[arg(short = 't', long)]
    pub shutdown_timeout: Option<u64>,

    /// Number of databases SELECT can switch between
    #[arg(short = 'd', long)]
    pub databases: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shutdown drain timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PubSubConfig {
    /// Undelivered messages buffered per subscription
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_databases")]
    pub databases: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            databases: default_databases(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    crate::pubsub::DEFAULT_CHANNEL_CAPACITY
}

fn default_databases() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub shutdown_timeout: Duration,
    pub channel_capacity: usize,
    pub databases: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already parsed CLI args, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => read_toml(path)?,
            None => TomlConfig::default(),
        };
        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            shutdown_timeout: Duration::from_secs(
                cli.shutdown_timeout
                    .unwrap_or(toml_config.server.shutdown_timeout),
            ),
            channel_capacity: toml_config.pubsub.channel_capacity,
            databases: cli.databases.unwrap_or(toml_config.storage.databases),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

fn read_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
