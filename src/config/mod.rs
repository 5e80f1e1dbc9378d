//! Configuration management

use crate::dial::DialOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local listen address
    pub listen: String,
    /// Negotiate transport compression
    #[serde(default)]
    pub compress: bool,
    /// Fixed OAuth access token
    #[serde(default)]
    pub access_token: Option<String>,
    /// Token type qualifier for the Authorization header
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Command that prints an access token (e.g. `gcloud auth print-access-token`)
    #[serde(default)]
    pub token_command: Option<String>,
    /// Tunnel target selection
    #[serde(default)]
    pub target: TargetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8022".to_string(),
            compress: false,
            access_token: None,
            token_type: default_token_type(),
            token_command: None,
            target: TargetConfig::default(),
        }
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Tunnel target selection; unset fields are omitted from the connect URL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl TargetConfig {
    /// Dial options for this target (token source and compression are
    /// attached separately).
    pub fn dial_options(&self) -> DialOptions {
        let mut opts = DialOptions::new();
        opts.zone = self.zone.clone();
        opts.region = self.region.clone();
        opts.project = self.project.clone();
        opts.port = self.port.clone();
        opts.network = self.network.clone();
        opts.interface = self.interface.clone();
        opts.instance = self.instance.clone();
        opts.host = self.host.clone();
        opts.group = self.group.clone();
        opts
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
