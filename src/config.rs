//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Compare event-loop, async and thread-pool TCP echo servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of concurrent client connections per engine
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Round trips per client connection
    #[arg(short = 'l', long)]
    pub loop_count: Option<usize>,

    /// Payload size in bytes for each request
    #[arg(short = 'p', long)]
    pub payload_len: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Role to run; servers and client together when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run all three engines on their fixed ports
    Server,
    /// Benchmark the engines running on a remote host
    Client {
        /// IP address of the host running `server`
        address: IpAddr,
    },
}

/// What this process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client(IpAddr),
    /// Servers on loopback, then the client against them.
    Both,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bench: BenchSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the engines bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_cooperative_port")]
    pub cooperative_port: u16,
    #[serde(default = "default_event_loop_port")]
    pub event_loop_port: u16,
    #[serde(default = "default_thread_pool_port")]
    pub thread_pool_port: u16,
    /// Per-connection buffer capacity; larger frames are violations
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Listen backlog; connections beyond the thread pool wait here
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum concurrently served connections on the thread-pool engine
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// Tokio worker threads for the cooperative engine (defaults to CPU count)
    pub cooperative_workers: Option<usize>,
    /// Readiness events drained per poll by the event-loop engine
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            cooperative_port: default_cooperative_port(),
            event_loop_port: default_event_loop_port(),
            thread_pool_port: default_thread_pool_port(),
            buffer_size: default_buffer_size(),
            backlog: default_backlog(),
            thread_pool_size: default_thread_pool_size(),
            cooperative_workers: None,
            events_capacity: default_events_capacity(),
        }
    }
}

/// Benchmark client configuration
#[derive(Debug, Deserialize)]
pub struct BenchSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_loop_count")]
    pub loop_count: usize,
    #[serde(default = "default_payload_len")]
    pub payload_len: usize,
    /// Pause before each engine's run
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Delay before the client starts when running both roles
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Tokio worker threads for the client (defaults to CPU count)
    pub client_workers: Option<usize>,
}

impl Default for BenchSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            loop_count: default_loop_count(),
            payload_len: default_payload_len(),
            cooldown_ms: default_cooldown_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            client_workers: None,
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_cooperative_port() -> u16 {
    17001
}

fn default_event_loop_port() -> u16 {
    17002
}

fn default_thread_pool_port() -> u16 {
    17003
}

fn default_buffer_size() -> usize {
    1000
}

fn default_backlog() -> i32 {
    1000
}

fn default_thread_pool_size() -> usize {
    512
}

fn default_events_capacity() -> usize {
    1024
}

fn default_concurrency() -> usize {
    500
}

fn default_loop_count() -> usize {
    100
}

fn default_payload_len() -> usize {
    1000
}

fn default_cooldown_ms() -> u64 {
    1000
}

fn default_startup_delay_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    pub fn cooperative_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.cooperative_port)
    }

    pub fn event_loop_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.event_loop_port)
    }

    pub fn thread_pool_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.thread_pool_port)
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub concurrency: usize,
    pub loop_count: usize,
    pub payload_len: usize,
    pub cooldown_ms: u64,
    pub startup_delay_ms: u64,
    pub client_workers: Option<usize>,
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

        let mode = match cli.command {
            Some(Command::Server) => Mode::Server,
            Some(Command::Client { address }) => Mode::Client(address),
            None => Mode::Both,
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            mode,
            server: toml_config.server,
            concurrency: cli.concurrency.unwrap_or(toml_config.bench.concurrency),
            loop_count: cli.loop_count.unwrap_or(toml_config.bench.loop_count),
            payload_len: cli.payload_len.unwrap_or(toml_config.bench.payload_len),
            cooldown_ms: toml_config.bench.cooldown_ms,
            startup_delay_ms: toml_config.bench.startup_delay_ms,
            client_workers: toml_config.bench.client_workers,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("server.buffer_size", self.server.buffer_size),
            ("server.thread_pool_size", self.server.thread_pool_size),
            ("server.events_capacity", self.server.events_capacity),
            ("bench.concurrency", self.concurrency),
            ("bench.payload_len", self.payload_len),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
        }
        if self.payload_len > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "bench.payload_len",
                "must fit in a 4-byte frame header",
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
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
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid configuration '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.server.cooperative_port, 17001);
        assert_eq!(config.server.event_loop_port, 17002);
        assert_eq!(config.server.thread_pool_port, 17003);
        assert_eq!(config.server.buffer_size, 1000);
        assert_eq!(config.server.backlog, 1000);
        assert_eq!(config.bench.concurrency, 500);
        assert_eq!(config.bench.loop_count, 100);
        assert_eq!(config.bench.payload_len, 1000);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            event_loop_port = 18002
            buffer_size = 1024
            thread_pool_size = 64
            cooperative_workers = 4

            [bench]
            concurrency = 10
            cooldown_ms = 0

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.server.event_loop_port, 18002);
        assert_eq!(config.server.cooperative_port, 17001);
        assert_eq!(config.server.buffer_size, 1024);
        assert_eq!(config.server.thread_pool_size, 64);
        assert_eq!(config.server.cooperative_workers, Some(4));
        assert_eq!(config.bench.concurrency, 10);
        assert_eq!(config.bench.loop_count, 100);
        assert_eq!(config.bench.cooldown_ms, 0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_modes() {
        let cli = CliArgs::parse_from(["echo-bench"]);
        assert_eq!(Config::from_cli(cli).unwrap().mode, Mode::Both);

        let cli = CliArgs::parse_from(["echo-bench", "server"]);
        assert_eq!(Config::from_cli(cli).unwrap().mode, Mode::Server);

        let cli = CliArgs::parse_from(["echo-bench", "-n", "8", "client", "10.0.0.7"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.mode, Mode::Client("10.0.0.7".parse().unwrap()));
        assert_eq!(config.concurrency, 8);
    }

    #[test]
    fn test_rejects_zero_payload() {
        let cli = CliArgs::parse_from(["echo-bench", "--payload-len", "0"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::Invalid("bench.payload_len", _))
        ));
    }
}
