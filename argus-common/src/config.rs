//! Configuration types for the Argus proxy

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArgusConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Inference backend the proxy forwards to
    #[serde(default)]
    pub backend: BackendConfig,

    /// Metric store and exposition settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server listening configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable access logging
    #[serde(default = "default_true")]
    pub access_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            access_log: true,
        }
    }
}

/// Backend connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `http://localhost:11434`
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Health probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub health_timeout: u64,

    /// Path probed by `/health` and at startup
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout: default_timeout(),
            health_timeout: default_health_timeout(),
            health_path: default_health_path(),
        }
    }
}

/// Metrics configuration
///
/// ```toml
/// [metrics]
/// namespace = "ollama"
/// max_samples = 1000
///
/// [metrics.labels]
/// instance = "gpu-box-1"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prefix for every metric family name
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Sample window cap per model and metric
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Constant labels appended to every exposed sample
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_samples: default_max_samples(),
            labels: BTreeMap::new(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_backend_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    2
}

fn default_health_path() -> String {
    "/api/version".to_string()
}

fn default_namespace() -> String {
    "ollama".to_string()
}

fn default_max_samples() -> usize {
    1000
}

impl ArgusConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Check values that serde defaults cannot guard
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port cannot be 0".to_string(),
            ));
        }

        if !self.backend.url.starts_with("http://") {
            return Err(ConfigError::ValidationError(format!(
                "backend url '{}' must use plain http://",
                self.backend.url
            )));
        }

        if self.backend.timeout == 0 || self.backend.health_timeout == 0 {
            return Err(ConfigError::ValidationError(
                "backend timeouts must be at least 1 second".to_string(),
            ));
        }

        if self.metrics.max_samples < 2 {
            return Err(ConfigError::ValidationError(
                "metrics.max_samples must be at least 2".to_string(),
            ));
        }

        if !is_metric_prefix(&self.metrics.namespace) {
            return Err(ConfigError::ValidationError(format!(
                "metrics namespace '{}' is not a valid metric name prefix",
                self.metrics.namespace
            )));
        }

        for key in self.metrics.labels.keys() {
            if !is_metric_prefix(key) {
                return Err(ConfigError::ValidationError(format!(
                    "metrics label '{}' is not a valid label name",
                    key
                )));
            }
            if RESERVED_LABELS.contains(&key.as_str()) || key.starts_with("__") {
                return Err(ConfigError::ValidationError(format!(
                    "metrics label '{}' is reserved",
                    key
                )));
            }
        }

        Ok(())
    }
}

/// Labels the exposition sets itself
const RESERVED_LABELS: [&str; 2] = ["model", "quantile"];

/// `[a-zA-Z_][a-zA-Z0-9_]*`, shared by metric prefixes and label names
fn is_metric_prefix(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
