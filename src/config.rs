//! Persistent application configuration
//!
//! Stores probe cadence, padding, per-transport enable flags, and endpoints
//! in a JSON file at `<data_dir>/rttprobe/config.json`.

use rttprobe_core::{ProbeSettings, TransportId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or writing the config file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_interval_ms() -> i64 {
    rttprobe_core::DEFAULT_INTERVAL_MS as i64
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Probe interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,
    /// Filler bytes added to each probe
    #[serde(default)]
    pub padding_bytes: i64,
    /// Last enable choice per transport (missing = enabled)
    #[serde(default)]
    pub enabled: BTreeMap<TransportId, bool>,
    /// Endpoint URL per transport (missing = built-in default)
    #[serde(default)]
    pub endpoints: BTreeMap<TransportId, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            padding_bytes: 0,
            enabled: BTreeMap::new(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Config file path: `<data_dir>/rttprobe/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rttprobe")
            .join("config.json")
    }

    /// Load config from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match Self::read(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "Loaded config from disk");
                config
            }
            Err(ConfigError::Io(_)) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                Self::default()
            }
        }
    }

    /// Read and parse `path`
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Engine settings described by this config
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            interval_ms: self.interval_ms,
            padding_bytes: self.padding_bytes,
            enabled: self.enabled.clone(),
        }
    }

    /// Remember the engine's current enable flags (and cadence)
    pub fn remember(&mut self, settings: &ProbeSettings) {
        self.interval_ms = settings.interval_ms;
        self.padding_bytes = settings.padding_bytes;
        for id in TransportId::ALL {
            self.enabled.insert(id, settings.is_enabled(id));
        }
    }

    /// Endpoint for a transport
    pub fn endpoint(&self, id: TransportId) -> String {
        self.endpoints
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.default_endpoint().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.interval_ms, 100);
        assert_eq!(config.padding_bytes, 0);
        assert!(config.enabled.is_empty());
        assert_eq!(
            config.endpoint(TransportId::Stream),
            "ws://127.0.0.1:8920/echo"
        );
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"padding_bytes": 128}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.padding_bytes, 128);
        assert_eq!(config.interval_ms, 100);
        assert!(config.probe_settings().is_enabled(TransportId::Unreliable));
    }

    #[test]
    fn test_endpoint_override() {
        let json = r#"{"endpoints": {"unreliable": "udp://10.0.0.5:9000"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.endpoint(TransportId::Unreliable),
            "udp://10.0.0.5:9000"
        );
        assert_eq!(config.endpoint(TransportId::Reliable), "tcp://127.0.0.1:8921");
    }

    #[test]
    fn test_remember_records_every_transport() {
        let mut settings = ProbeSettings::default();
        settings.set_enabled(TransportId::Stream, false);
        let mut config = AppConfig::default();
        config.remember(&settings);
        assert_eq!(config.enabled.len(), 3);
        assert!(!config.enabled[&TransportId::Stream]);
        assert!(config.enabled[&TransportId::Reliable]);
    }

    #[test]
    fn test_load_uses_default_path() {
        assert_eq!(AppConfig::load(), AppConfig::load_from(&AppConfig::path()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.interval_ms = 250;
        config.enabled.insert(TransportId::Reliable, false);
        config.save(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded, config);
        assert!(!loaded.probe_settings().is_enabled(TransportId::Reliable));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(AppConfig::read(&path), Err(ConfigError::Json(_))));
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
    }
}
