//! Configuration: CLI arguments (`clap`) merged with an optional TOML file,
//! producing the resolved `Config` record the rest of the crate consumes.
//!
//! CLI arguments take precedence over the TOML file, which takes
//! precedence over built-in defaults. This mirrors `grow-a-cache`'s
//! `config.rs` merge strategy.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the SOCKSv5 proxy.
#[derive(Parser, Debug)]
#[command(name = "socks5-proxy")]
#[command(author = "socks5-proxy authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent SOCKSv5 proxy with username/password auth", long_about = None)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// SOCKS bind address (e.g. 0.0.0.0:1080).
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Management protocol UDP bind address (e.g. 127.0.0.1:8080).
    #[arg(long)]
    pub mgmt_listen: Option<String>,

    /// Seed user as name:password. Repeatable.
    #[arg(short = 'u', long = "user", value_parser = parse_user)]
    pub users: Vec<(String, String)>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-connection buffer size in bytes.
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Size of the recycled-connection pool.
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Selector poll timeout in seconds (bounds shutdown-flag latency).
    #[arg(long)]
    pub poll_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn parse_user(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((name, pass)) if !name.is_empty() && !pass.is_empty() => {
            Ok((name.to_string(), pass.to_string()))
        }
        _ => Err(format!("invalid user '{s}', expected name:password")),
    }
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub users: Vec<TomlUser>,
}

#[derive(Debug, Deserialize)]
pub struct TomlUser {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_mgmt_listen")]
    pub mgmt_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mgmt_listen: default_mgmt_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            pool_size: default_pool_size(),
            poll_timeout_secs: default_poll_timeout_secs(),
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

fn default_listen() -> String {
    "0.0.0.0:1080".to_string()
}

fn default_mgmt_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    500
}

fn default_buffer_size() -> usize {
    4096
}

fn default_pool_size() -> usize {
    50
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final, resolved configuration consumed by `runtime::run`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub mgmt_listen: String,
    pub users: Vec<(String, String)>,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub pool_size: usize,
    pub poll_timeout_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file. CLI
    /// arguments take precedence over TOML file values, which take
    /// precedence over defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut users: Vec<(String, String)> = toml_config
            .users
            .into_iter()
            .map(|u| (u.name, u.password))
            .collect();
        users.extend(cli.users);

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            mgmt_listen: cli.mgmt_listen.unwrap_or(toml_config.server.mgmt_listen),
            users,
            max_connections: cli.max_connections.unwrap_or(toml_config.limits.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.limits.buffer_size),
            pool_size: cli.pool_size.unwrap_or(toml_config.limits.pool_size),
            poll_timeout_secs: cli
                .poll_timeout_secs
                .unwrap_or(toml_config.limits.poll_timeout_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
