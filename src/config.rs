use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind the listener on
    pub host: String,

    /// Port to bind the listener on (0 picks an ephemeral port)
    pub port: u16,

    /// Accept encrypted termite agents instead of plain reverse shells
    pub encrypted: bool,

    /// Fingerprint format template; empty selects the default
    pub hash_format: String,

    /// Default group-dispatch flag applied to newly registered clients
    pub group_dispatch: bool,

    /// Deadline for the 4-byte protocol sniff on plaintext connections
    pub sniff_timeout_ms: u64,

    /// Deadline for the identity probe on freshly accepted connections
    pub probe_timeout_ms: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            encrypted: false,
            hash_format: String::new(),
            group_dispatch: true,
            sniff_timeout_ms: 3000,
            probe_timeout_ms: 5000,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| crate::AnteaterError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::AnteaterError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
