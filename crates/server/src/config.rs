//! Server configuration management

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_clients: u32,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 7575,
            max_clients: 32,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from an explicit path, or else from [`Self::default_path`]. Returns an error if
    /// neither exists or the file found doesn't parse/validate.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);
        if !config_path.exists() {
            return Err(anyhow!("no configuration file found at {}", config_path.display()));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;
        config.validate()?;

        tracing::info!("loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the default path, falling back to built-in defaults on any error (missing
    /// file, bad TOML, failed validation) rather than failing startup.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::info!("saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(config_dir) => config_dir.join("vusb").join("server.toml"),
            None => PathBuf::from(".config/vusb/server.toml"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients must be at least 1"));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be nonzero"));
        }
        Ok(())
    }
}

/// Legacy entry point for scripts that still pass a bare (possibly `~`-relative) path string.
#[allow(dead_code)]
pub fn load_config(path: &str) -> Result<ServerConfig> {
    let expanded = shellexpand::tilde(path);
    ServerConfig::load(Some(PathBuf::from(expanded.as_ref())))
}
