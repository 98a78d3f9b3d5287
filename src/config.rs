//! Configuration for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::frame::{HEADER_SIZE, MAX_FRAME_SIZE};
use crate::runtime::TaskConfig;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "gutil-echo")]
#[command(version = "0.1.0")]
#[command(about = "Framed TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of runtime worker threads (-1 = all CPU cores)
    #[arg(short = 'w', long, allow_hyphen_values = true)]
    pub workers: Option<i32>,

    /// Seconds a connection may stay unverified
    #[arg(short = 't', long)]
    pub verify_timeout: Option<u64>,

    /// Largest accepted frame, header included
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Token clients must present in their hello frame
    #[arg(long)]
    pub auth_token: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub task: TaskSection,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of runtime worker threads
    pub workers: Option<i32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Deserialize)]
pub struct TaskSection {
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            verify_timeout_secs: default_verify_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Echo protocol settings
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    /// Expected hello token; any token is accepted when unset
    pub auth_token: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            max_connections: default_max_connections(),
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

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_verify_timeout() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_max_connections() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<i32>,
    pub task: TaskConfig,
    pub auth_token: Option<String>,
    pub max_connections: usize,
    pub log_level: String,
    /// Arguments the configuration was built from, kept for reloads.
    cli: CliArgs,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge `cli` over the TOML file it names (if any).
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let max_frame_size = cli
            .max_frame_size
            .unwrap_or(toml_config.task.max_frame_size);
        if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&max_frame_size) {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between {HEADER_SIZE} and {MAX_FRAME_SIZE}, got {max_frame_size}"
            )));
        }

        let verify_timeout = cli
            .verify_timeout
            .unwrap_or(toml_config.task.verify_timeout_secs);

        Ok(Config {
            listen: cli.listen.clone().unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            task: TaskConfig {
                max_frame_size,
                verify_timeout: Duration::from_secs(verify_timeout),
                ..TaskConfig::default()
            },
            auth_token: cli.auth_token.clone().or(toml_config.echo.auth_token),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.echo.max_connections),
            log_level: cli.log_level.clone().unwrap_or(toml_config.logging.level),
            cli,
        })
    }

    /// Re-read the configuration file, keeping command-line overrides.
    pub fn reload(&self) -> Result<Self, ConfigError> {
        Self::resolve(self.cli.clone())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gutil-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.task.verify_timeout_secs, 30);
        assert_eq!(config.task.max_frame_size, 128 * 1024);
        assert!(config.echo.auth_token.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7100"
            workers = 4

            [task]
            verify_timeout_secs = 10
            max_frame_size = 4096

            [echo]
            auth_token = "secret"
            max_connections = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7100");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.task.verify_timeout_secs, 10);
        assert_eq!(config.task.max_frame_size, 4096);
        assert_eq!(config.echo.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.echo.max_connections, 16);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_resolve_defaults() {
        let config = Config::resolve(CliArgs::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.task.verify_timeout, Duration::from_secs(30));
        assert_eq!(config.task.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = temp_config(
            "override",
            "[server]\nlisten = \"0.0.0.0:1\"\n[task]\nverify_timeout_secs = 5\n",
        );
        let cli = CliArgs::parse_from([
            "gutil-echo",
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "127.0.0.1:9999",
            "--workers",
            "-1",
        ]);

        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert_eq!(config.workers, Some(-1));
        assert_eq!(config.task.verify_timeout, Duration::from_secs(5));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_reload_rereads_file() {
        let path = temp_config("reload", "[echo]\nauth_token = \"one\"\n");
        let cli = CliArgs {
            config: Some(path.clone()),
            ..CliArgs::default()
        };
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.auth_token.as_deref(), Some("one"));

        std::fs::write(&path, "[echo]\nauth_token = \"two\"\n").unwrap();
        let reloaded = config.reload().unwrap();
        assert_eq!(reloaded.auth_token.as_deref(), Some("two"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_invalid_frame_size() {
        let cli = CliArgs {
            max_frame_size: Some(MAX_FRAME_SIZE + 1),
            ..CliArgs::default()
        };
        assert!(matches!(Config::resolve(cli), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/gutil.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(Config::resolve(cli), Err(ConfigError::FileRead(..))));
    }
}
