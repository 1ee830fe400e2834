//! Application configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{RoninError, RoninResult};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// User data directory (history, local storage)
    pub data_dir: PathBuf,

    /// Cache directory (offline cache generations)
    pub cache_dir: PathBuf,

    /// Origin the app is served from
    pub origin: String,

    /// Path of the generation relay, relative to the origin
    pub relay_path: String,

    /// Offline cache version label
    pub cache_version: String,

    /// Local storage key holding the history
    pub history_key: String,

    /// User agent string
    pub user_agent: String,

    /// Activate new cache generations right after install
    pub skip_waiting_after_install: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ronin"),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ronin"),
            origin: "http://localhost:8888/".to_string(),
            relay_path: "/.netlify/functions/generate".to_string(),
            cache_version: "ronins-maths-v4.0".to_string(),
            history_key: "vizkid_history".to_string(),
            user_agent: format!("Ronin/{}", env!("CARGO_PKG_VERSION")),
            skip_waiting_after_install: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> RoninResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| RoninError::config(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> RoninResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> RoninResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Parsed origin URL.
    pub fn origin_url(&self) -> RoninResult<Url> {
        Ok(Url::parse(&self.origin)?)
    }

    /// Absolute URL of the generation relay.
    pub fn relay_url(&self) -> RoninResult<Url> {
        Ok(self.origin_url()?.join(&self.relay_path)?)
    }

    /// File backing local storage.
    pub fn local_storage_path(&self) -> PathBuf {
        self.data_dir.join("local_storage.json")
    }

    /// Directory holding offline cache generations.
    pub fn generations_dir(&self) -> PathBuf {
        self.cache_dir.join("generations")
    }
}
