//! Runtime Discovery
//!
//! Locates the native runtime installation that module files are loaded
//! from. Probes, in order: the configured install directory, configured
//! extra search paths, the well-known default install locations, then every
//! entry of `PATH`. The first directory containing the marker executable
//! wins.

use std::path::{Path, PathBuf};

use crate::config::RuntimeConfig;
use crate::error::{BridgeError, BridgeResult};

/// Default marker executable name, without platform suffix.
const DEFAULT_MARKER: &str = "svn";

/// A discovered native runtime installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLocation {
    install_dir: PathBuf,
}

impl RuntimeLocation {
    /// Use `dir` directly, without probing.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: dir.into(),
        }
    }

    /// Probe for an installation as described by `config`.
    pub fn discover(config: &RuntimeConfig) -> BridgeResult<Self> {
        let marker = marker_filename(config.marker.as_deref().unwrap_or(DEFAULT_MARKER));
        let mut probed = Vec::new();

        if let Some(dir) = &config.install_dir {
            if contains_marker(dir, &marker) {
                return Ok(Self::at(dir));
            }
            probed.push(dir.clone());
        }

        for dir in config
            .search_paths
            .iter()
            .cloned()
            .chain(default_install_dirs())
            .chain(path_entries())
        {
            if contains_marker(&dir, &marker) {
                return Ok(Self::at(&dir));
            }
            probed.push(dir);
        }

        Err(BridgeError::RuntimeNotFound {
            detail: format!(
                "no directory containing '{}' among {} probed locations",
                marker,
                probed.len()
            ),
        })
    }

    /// The installation directory module paths are resolved against.
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Full path for a normalized module file name.
    pub fn module_path(&self, file_name: &str) -> PathBuf {
        self.install_dir.join(file_name)
    }
}

fn contains_marker(dir: &Path, marker: &str) -> bool {
    dir.join(marker).is_file()
}

fn marker_filename(name: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".exe") {
            name.to_string()
        } else {
            format!("{}.exe", name)
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        name.to_string()
    }
}

fn default_install_dirs() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from(r"C:\Program Files\Subversion\bin"),
            PathBuf::from(r"C:\Program Files (x86)\Subversion\bin"),
        ]
    }
    #[cfg(not(target_os = "windows"))]
    {
        vec![
            PathBuf::from("/usr/lib"),
            PathBuf::from("/usr/local/lib"),
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
        ]
    }
}

fn path_entries() -> Vec<PathBuf> {
    match std::env::var_os("PATH") {
        Some(path) => std::env::split_paths(&path).collect(),
        None => Vec::new(),
    }
}
