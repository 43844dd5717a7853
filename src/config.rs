//! Configuration for the sequence-streaming server.
//!
//! Supports both command-line arguments and an optional TOML
//! configuration file. CLI arguments take precedence over file values,
//! which take precedence over built-in defaults.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "seqstream")]
#[command(about = "Streams interleaved arithmetic sequences over a line-oriented TCP protocol")]
pub struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Number of worker threads (defaults to available parallelism)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub workers: Option<usize>,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_refill_cap")]
    pub refill_cap: usize,
    #[serde(default = "default_output_soft_cap")]
    pub output_soft_cap: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            max_events: default_max_events(),
            refill_cap: default_refill_cap(),
            output_soft_cap: default_output_soft_cap(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_max_events() -> usize {
    4096
}

fn default_refill_cap() -> usize {
    5000
}

fn default_output_soft_cap() -> usize {
    16 * 64 * 1024 // 16 * 64 KiB
}

fn default_max_connections() -> usize {
    65536
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub max_events: usize,
    pub refill_cap: usize,
    pub output_soft_cap: usize,
    pub max_connections: usize,
    pub log_level: String,
    /// Upper bound on each worker's `poll()` wait, so `stop()` is
    /// observed promptly (spec.md §5: "workers observe it on their
    /// next timed wake (timeout ≤ 500 ms)"). Configurable via
    /// `[server] poll_timeout_ms` in the TOML file; defaults to 500ms.
    pub poll_timeout: Duration,
}

impl Config {
    /// Loads configuration from CLI args and an optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    pub(crate) fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers),
            max_events: toml_config.server.max_events,
            refill_cap: toml_config.server.refill_cap,
            output_soft_cap: toml_config.server.output_soft_cap,
            max_connections: toml_config.server.max_connections,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            poll_timeout: Duration::from_millis(toml_config.server.poll_timeout_ms),
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
