//! Configuration file support for Liftlog.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/liftlog/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub calories: CaloriesConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Adaptive rest configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_base_rest_seconds")]
    pub base_rest_seconds: u32,

    /// Schedule an adaptive rest automatically after each completed set
    #[serde(default = "default_smart_rest")]
    pub smart_rest: bool,

    /// Upper bound on the fatigue multiplier, guarding against runaway values
    #[serde(default = "default_max_fatigue_multiplier")]
    pub max_fatigue_multiplier: f32,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_rest_seconds: default_base_rest_seconds(),
            smart_rest: default_smart_rest(),
            max_fatigue_multiplier: default_max_fatigue_multiplier(),
        }
    }
}

/// Sync reconciler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory standing in for the remote store (a mounted or synced
    /// folder). No remote configured means sets stay pending locally.
    #[serde(default)]
    pub remote_dir: Option<PathBuf>,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_dir: None,
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Calorie heuristic coefficients.
///
/// These are deliberately simple placeholders, not a physiological model;
/// the only contract is that the estimate never decreases as sets append.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaloriesConfig {
    /// kcal per kg·rep of volume
    #[serde(default = "default_per_volume_kg")]
    pub per_volume_kg: f64,

    /// kcal per minute of active (non-paused) time
    #[serde(default = "default_per_active_minute")]
    pub per_active_minute: f64,
}

impl Default for CaloriesConfig {
    fn default() -> Self {
        Self {
            per_volume_kg: default_per_volume_kg(),
            per_active_minute: default_per_active_minute(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").expect("HOME environment variable not set");
        PathBuf::from(home).join(".local/share")
    });
    base.join("liftlog")
}

fn default_base_rest_seconds() -> u32 {
    90
}

fn default_smart_rest() -> bool {
    true
}

fn default_max_fatigue_multiplier() -> f32 {
    2.0
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_per_volume_kg() -> f64 {
    0.05
}

fn default_per_active_minute() -> f64 {
    5.0
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").expect("HOME environment variable not set");
            PathBuf::from(home).join(".config")
        });
        base.join("liftlog").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.rest.base_rest_seconds == 0 {
            return Err(Error::Config("base_rest_seconds must be positive".into()));
        }
        if self.rest.max_fatigue_multiplier < 1.0 {
            return Err(Error::Config(
                "max_fatigue_multiplier must be at least 1.0".into(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rest.base_rest_seconds, 90);
        assert!(config.rest.smart_rest);
        assert_eq!(config.sync.max_attempts, 8);
        assert!(config.sync.remote_dir.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.rest.base_rest_seconds, parsed.rest.base_rest_seconds);
        assert_eq!(config.sync.base_backoff_ms, parsed.sync.base_backoff_ms);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[rest]
base_rest_seconds = 120
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.rest.base_rest_seconds, 120);
        assert_eq!(config.sync.max_attempts, 8); // default
    }

    #[test]
    fn test_invalid_config_rejected() {
        let toml_str = r#"
[rest]
max_fatigue_multiplier = 0.5
"#;
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, toml_str).unwrap();

        let result = Config::load_from(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
