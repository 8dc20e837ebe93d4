//! Configuration module for the fortytwo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use crate::runtime::TERMINATOR;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "fortytwo")]
#[command(author = "fortytwo authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that answers \"42\"-terminated requests", long_about = None)]
pub struct CliArgs {
    /// Handler script loaded at startup
    pub script: PathBuf,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (all IPv4 interfaces)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Largest request accepted before the terminator, in bytes (unbounded if unset)
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Initial size of the per-connection read buffer, in bytes
    #[arg(long)]
    pub initial_buffer_size: Option<usize>,

    /// What to do with the in-flight connection when a shutdown signal arrives
    #[arg(long, value_enum)]
    pub shutdown: Option<ShutdownMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// How the server reacts to SIGINT, SIGTERM and SIGHUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Close the listener and exit the process at once.
    #[default]
    Immediate,
    /// Let the current connection finish, then leave the accept loop.
    Drain,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            shutdown: ShutdownMode::default(),
        }
    }
}

/// Request framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    /// Starting capacity of the read buffer
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,
    /// Upper bound on a frame; absent means unbounded
    pub max_frame_size: Option<usize>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: default_initial_buffer_size(),
            max_frame_size: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_port() -> u16 {
    8080
}

fn default_initial_buffer_size() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub script: PathBuf,
    pub port: u16,
    pub initial_buffer_size: usize,
    pub max_frame_size: Option<usize>,
    pub shutdown: ShutdownMode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let initial_buffer_size = cli
            .initial_buffer_size
            .unwrap_or(toml_config.framing.initial_buffer_size);
        if initial_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "initial buffer size must be at least 1 byte",
            ));
        }

        let max_frame_size = cli.max_frame_size.or(toml_config.framing.max_frame_size);
        if max_frame_size.is_some_and(|limit| limit < TERMINATOR.len()) {
            return Err(ConfigError::Invalid(
                "max frame size must leave room for the \"42\" terminator",
            ));
        }

        Ok(Config {
            script: cli.script,
            port: cli.port.unwrap_or(toml_config.server.port),
            initial_buffer_size,
            max_frame_size,
            shutdown: cli.shutdown.unwrap_or(toml_config.server.shutdown),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
