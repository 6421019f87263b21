//! Configuration Module
//!
//! Provides TOML-based configuration for mqgate with support for:
//! - Server settings (bind address, workers, socket options, timeouts)
//! - Protocol limits
//! - Metrics reporting and HTTP exposition
//! - `${VAR}` / `${VAR:-default}` substitution inside the file
//! - Environment variable overrides (MQGATE__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{num_cpus, BrokerConfig};
use crate::codec::{DEFAULT_MAX_PAYLOAD_SIZE, MAX_REMAINING_LENGTH};
use crate::topic::MAX_TOPIC_LENGTH;
use crate::transport::{TransportConfig, DEFAULT_TRAFFIC_CLASS};

pub use metrics::MetricsConfig;

mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("substitution pattern is valid")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Protocol limits
    pub limits: LimitsConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Number of worker threads (0 = CPU count)
    pub workers: usize,
    /// IP type-of-service byte for accepted sockets (0 = leave unset)
    #[serde(default = "default_traffic_class")]
    pub traffic_class: u32,
    /// Time allowed between accept and CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Time connections get to close on shutdown before being aborted
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}
fn default_traffic_class() -> u32 {
    DEFAULT_TRAFFIC_CLASS
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
            traffic_class: default_traffic_class(),
            connect_timeout: default_connect_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Protocol limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum remaining length of an inbound packet in bytes
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Maximum byte length of a subscription filter
    #[serde(default = "default_max_topic_length")]
    pub max_topic_length: usize,
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}
fn default_max_topic_length() -> usize {
    MAX_TOPIC_LENGTH
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            max_topic_length: default_max_topic_length(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, layering environment overrides
    /// on top. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.workers", 0)?
            .set_default("server.traffic_class", DEFAULT_TRAFFIC_CLASS as i64)?
            .set_default("server.connect_timeout", "30s")?
            .set_default("server.shutdown_timeout", "5s")?
            .set_default("limits.max_payload_size", DEFAULT_MAX_PAYLOAD_SIZE as i64)?
            .set_default("limits.max_topic_length", MAX_TOPIC_LENGTH as i64)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?
            .set_default("metrics.top_topics", 10)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (MQGATE__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse a TOML document (no substitution or environment overrides)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_payload_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_payload_size must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_payload_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "limits.max_payload_size cannot exceed {} bytes",
                MAX_REMAINING_LENGTH
            )));
        }

        if self.limits.max_topic_length == 0 || self.limits.max_topic_length > MAX_TOPIC_LENGTH {
            return Err(ConfigError::Validation(format!(
                "limits.max_topic_length must be between 1 and {}",
                MAX_TOPIC_LENGTH
            )));
        }

        if self.server.traffic_class > u8::MAX as u32 {
            return Err(ConfigError::Validation(
                "server.traffic_class must fit in one byte".to_string(),
            ));
        }

        if self.metrics.report_interval == Some(Duration::ZERO) {
            return Err(ConfigError::Validation(
                "metrics.report_interval must be greater than 0".to_string(),
            ));
        }

        match self.log.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }

    /// Broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        let num_workers = if self.server.workers == 0 {
            num_cpus::get()
        } else {
            self.server.workers
        };

        BrokerConfig {
            bind_addr: self.server.bind,
            max_payload_size: self.limits.max_payload_size,
            max_topic_length: self.limits.max_topic_length,
            connect_timeout: self.server.connect_timeout,
            shutdown_timeout: self.server.shutdown_timeout,
            transport: TransportConfig {
                tcp_nodelay: true,
                traffic_class: (self.server.traffic_class != 0)
                    .then_some(self.server.traffic_class),
            },
            report_interval: self.metrics.report_interval,
            report_top_topics: self.metrics.top_topics,
            num_workers,
        }
    }
}
