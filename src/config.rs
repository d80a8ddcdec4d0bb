// Configuration for the messenger and the CLI
//
// Stored as JSON in <config dir>/relaychat/config.json. Every field is
// optional in the file; missing ones take the defaults below.

use anyhow::{anyhow, Context, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ConnectionSettings;

const APP_DIR: &str = "relaychat";

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin of the hosting page; decides the relay scheme
    pub origin: String,
    /// Explicit relay URL, overriding the one derived from `origin`
    pub relay_url: Option<String>,
    pub relay_path: String,
    pub display_name: String,
    pub avatar: String,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub failure_threshold: u32,
    pub sync_pacing_ms: u64,
    pub offline_grace_ms: u64,
    pub cache_ttl_secs: u64,
    pub schema_version: u32,
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            origin: "http://localhost:8080".to_string(),
            relay_url: None,
            relay_path: "/ws".to_string(),
            display_name: "anonymous".to_string(),
            avatar: String::new(),
            connect_timeout_ms: 5_000,
            reconnect_delay_ms: 5_000,
            failure_threshold: 3,
            sync_pacing_ms: 100,
            offline_grace_ms: 2_000,
            cache_ttl_secs: 7 * 24 * 60 * 60,
            schema_version: 1,
            data_dir: None,
        }
    }
}

impl Config {
    /// Load from the default location, falling back to defaults when no file exists
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be at least 1"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(anyhow!("connect_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn sync_pacing(&self) -> Duration {
        Duration::from_millis(self.sync_pacing_ms)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_millis(self.offline_grace_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Directory for the file-backed cache
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join(APP_DIR);
        Ok(dir)
    }
}

pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR);
    Ok(dir.join("config.json"))
}
