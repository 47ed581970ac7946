// src/config/models.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::ConfigError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port the front door listens on.
    pub port: u16,

    /// License server base URLs, in configuration order.
    pub servers: Vec<Url>,

    /// Access tokens. Empty disables path-prefix gating.
    pub tokens: Vec<String>,

    /// Seconds between two background sweeps.
    pub sweep_interval_secs: u64,

    pub probe: ProbeConfig,
    pub metrics: MetricsConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            servers: Vec::new(),
            tokens: Vec::new(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            probe: ProbeConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Checks the configuration is usable for running the proxy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers were provided".into()));
        }
        for server in &self.servers {
            if !matches!(server.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "unsupported scheme for server {server}"
                )));
            }
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be greater than zero".into(),
            ));
        }
        if self.tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid("tokens must not be blank".into()));
        }
        self.metrics.validate(self.port)
    }
}

/// Parameters of the synthetic obtain-ticket request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub machine_id: String,
    pub product_family_id: String,
    /// No timeout unless set; a hung probe only delays its own backend.
    pub timeout_secs: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            machine_id: "bd212404-223e-47af-9735-a09ba863550e".to_string(),
            product_family_id: "49c202d4-ac56-452b-bb84-735056242fb3".to_string(),
            timeout_secs: None,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl MetricsConfig {
    fn validate(&self, proxy_port: u16) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "metrics.path must start with '/'".into(),
            ));
        }
        if self.port == proxy_port {
            return Err(ConfigError::Invalid(format!(
                "metrics.port {} collides with the proxy port",
                self.port
            )));
        }
        Ok(())
    }
}
