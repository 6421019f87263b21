//! Metrics configuration

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the HTTP metrics endpoint is enabled
    pub enabled: bool,
    /// HTTP bind address for metrics endpoint
    pub bind: SocketAddr,
    /// Log the metrics report at this interval (disabled when absent)
    #[serde(with = "humantime_serde")]
    pub report_interval: Option<Duration>,
    /// Number of filters listed in the report
    pub top_topics: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
            report_interval: None,
            top_topics: 10,
        }
    }
}
