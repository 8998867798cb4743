//! Bridge Configuration
//!
//! Handles parsing and management of dynvoke.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching dynvoke.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Native runtime location settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Settings controlling where the native runtime is looked for.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Explicit installation directory; skips probing when set.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    /// Extra directories probed before the defaults.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Marker executable proving a directory is a runtime installation.
    /// Defaults to the platform name of `svn`.
    #[serde(default)]
    pub marker: Option<String>,
}

impl BridgeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `dynvoke.toml` in `dir`, falling back to defaults when the
    /// file is absent.
    pub fn load_or_default(dir: &Path) -> ConfigResult<Self> {
        let path = dir.join("dynvoke.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}
