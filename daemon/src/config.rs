/// Daemon configuration
use crate::errors::{DaemonError, DaemonResult};
use gantry_core::{ConfigManager, GantryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Daemon configuration: the core sections plus `[server]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(flatten)]
    pub core: GantryConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Serve `/metrics`
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            enable_metrics: default_enable_metrics(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_request_timeout() -> u64 {
    30
}

fn default_enable_metrics() -> bool {
    true
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Explicit file, else the core discovery order with defaults for `[server]`
    pub fn load_or_default(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let manager = ConfigManager::load(None)?;
                Ok(DaemonConfig {
                    server: ServerConfig::default(),
                    core: manager.into_config(),
                })
            }
        }
    }

    /// Apply `GANTRY_*` environment overrides
    pub fn load_from_env(&mut self) {
        self.core.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.server.port == 0 {
            return Err(DaemonError::ConfigError(
                "server.port must be non-zero".to_string(),
            ));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(DaemonError::ConfigError(
                "server.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.core.validate()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "127.0.0.1:7777");
    }

    #[test]
    fn test_server_section_alongside_core_sections() {
        let config: DaemonConfig = toml::from_str(
            "[server]\nport = 9000\n\n[pipelines]\nbase_url = \"https://ci.example.com\"\n",
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.core.pipelines.base_url, "https://ci.example.com");
        assert_eq!(config.core.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = DaemonConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.core.pipelines.default_step_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n[logging]\nformat = \"json\"\n").unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.core.logging.format, "json");
        assert!(DaemonConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
