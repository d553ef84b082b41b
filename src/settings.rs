//! Demo settings
//!
//! Read from `glomerate.toml` in the working directory, or from the file named
//! by `GLOMERATE_CONFIG`.

use std::fs;
use std::path::{Path, PathBuf};

use glomerate_ecs::EcsConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};

/// Environment variable overriding the settings path.
pub const CONFIG_ENV: &str = "GLOMERATE_CONFIG";

const DEFAULT_PATH: &str = "glomerate.toml";

/// All demo settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ecs: EcsConfig,
    pub logging: LoggingSettings,
}

/// How a settings load went. Loading happens before logging is set up, so the
/// outcome is reported afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(PathBuf),
    Missing(PathBuf),
    Invalid { path: PathBuf, reason: String },
}

impl LoadOutcome {
    pub fn report(&self) {
        match self {
            LoadOutcome::Loaded(path) => info!("Loaded settings from {:?}", path),
            LoadOutcome::Missing(path) => info!("No settings at {:?}, using defaults", path),
            LoadOutcome::Invalid { path, reason } => {
                warn!("Failed to load settings from {:?}: {}, using defaults", path, reason)
            }
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn settings_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PATH))
    }

    /// Load settings, or return defaults if the file is missing or unreadable
    pub fn load() -> (Self, LoadOutcome) {
        Self::load_from(&Self::settings_path())
    }

    pub fn load_from(path: &Path) -> (Self, LoadOutcome) {
        if !path.exists() {
            return (Self::default(), LoadOutcome::Missing(path.to_path_buf()));
        }

        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| toml::from_str::<Settings>(&content).map_err(|e| e.to_string()));
        match parsed {
            Ok(settings) => (settings, LoadOutcome::Loaded(path.to_path_buf())),
            Err(reason) => (
                Self::default(),
                LoadOutcome::Invalid {
                    path: path.to_path_buf(),
                    reason,
                },
            ),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// One of `trace`, `debug`, `info`, `warn`, `error`
    pub level: String,
    /// Include the module path in each line
    pub show_target: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
        }
    }
}

impl LoggingSettings {
    /// The configured level, falling back to `INFO` when it doesn't parse
    pub fn max_level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}
