/// Configuration management for Gantry.
/// Handles loading, parsing and validation of .gantry/config.toml
use crate::errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Top-level configuration structure for Gantry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GantryConfig {
    /// State store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Where workflow and pipeline definitions are read from
    #[serde(default)]
    pub definitions: DefinitionsConfig,

    /// Pipeline execution settings
    #[serde(default)]
    pub pipelines: PipelinesConfig,

    /// Webhook delivery settings
    #[serde(default)]
    pub webhooks: WebhooksConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn gantry_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".gantry"))
        .unwrap_or_else(|| PathBuf::from(".gantry"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    gantry_home().join("gantry.db")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    /// Project-local definitions; override global ones by name
    #[serde(default = "default_project_dir")]
    pub project_dir: Option<PathBuf>,

    #[serde(default = "default_global_dir")]
    pub global_dir: Option<PathBuf>,
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            global_dir: default_global_dir(),
        }
    }
}

fn default_project_dir() -> Option<PathBuf> {
    Some(PathBuf::from(".gantry"))
}

fn default_global_dir() -> Option<PathBuf> {
    Some(gantry_home())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinesConfig {
    /// Upper bound for one exec or prompt step
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,

    /// Public address used in approve/reject links
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Command line for prompt steps; the prompt is appended
    #[serde(default = "default_prompt_command")]
    pub prompt_command: Vec<String>,

    /// Working directory for step processes
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout(),
            base_url: default_base_url(),
            prompt_command: default_prompt_command(),
            working_dir: None,
        }
    }
}

fn default_step_timeout() -> u64 {
    300
}

fn default_base_url() -> String {
    crate::webhooks::DEFAULT_BASE_URL.to_string()
}

fn default_prompt_command() -> Vec<String> {
    vec!["claude".to_string(), "-p".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("gantry/{}", crate::VERSION)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl GantryConfig {
    pub fn from_toml(source: &str, path: &Path) -> ConfigResult<Self> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `GANTRY_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("GANTRY_DB_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("GANTRY_BASE_URL") {
            self.pipelines.base_url = url;
        }
        if let Some(level) = lookup("GANTRY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("GANTRY_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(secs) = lookup("GANTRY_STEP_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.pipelines.default_step_timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.pipelines.default_step_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "pipelines.default_step_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !self.pipelines.base_url.starts_with("http://")
            && !self.pipelines.base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "pipelines.base_url must be an http(s) URL, got '{}'",
                self.pipelines.base_url
            )));
        }

        if self.pipelines.prompt_command.is_empty() {
            return Err(ConfigError::Invalid(
                "pipelines.prompt_command must name a program".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }

        if self.definitions.project_dir.is_none() && self.definitions.global_dir.is_none() {
            warn!("No definition directories configured; only registered definitions are available");
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

/// Configuration manager for loading and saving configs
pub struct ConfigManager {
    config: GantryConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from `config_path`, else `./.gantry/config.toml`,
    /// else `~/.gantry/config.toml`, else defaults.
    pub fn load(config_path: Option<&Path>) -> ConfigResult<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => {
                let project = PathBuf::from(".gantry/config.toml");
                if project.exists() {
                    project
                } else {
                    gantry_home().join("config.toml")
                }
            }
        };

        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            GantryConfig::from_toml(&content, &path)?
        } else if config_path.is_some() {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                message: "file not found".to_string(),
            });
        } else {
            debug!("No config file at {:?}, using defaults", path);
            GantryConfig::default()
        };

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    pub fn from_config(config: GantryConfig, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
        }
    }

    pub fn config(&self) -> &GantryConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GantryConfig {
        &mut self.config
    }

    pub fn into_config(self) -> GantryConfig {
        self.config
    }

    /// Apply overrides from process environment variables
    pub fn load_from_env(&mut self) {
        self.config.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.config.validate()
    }

    /// Save configuration to file
    pub fn save(&self) -> ConfigResult<()> {
        let io_error = |e: std::io::Error| ConfigError::Io {
            path: self.config_path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| ConfigError::Invalid(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&self.config_path, content).map_err(io_error)?;

        info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
