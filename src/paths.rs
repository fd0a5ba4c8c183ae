//! Locations of the on-disk configuration files.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Overrides the configuration directory (default `~/.beakerutil`).
pub const CONFIG_DIR_ENV: &str = "BEAKERUTIL_CONFIG_DIR";

const DEFAULTS_FILE: &str = "config.yaml";
const LAUNCH_FILE: &str = "launch.conf";

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve the configuration directory from the environment.
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(Self::new(dir));
        }
        Ok(Self::new(home_dir()?.join(".beakerutil")))
    }

    /// The remembered-defaults store.
    pub fn defaults_file(&self) -> PathBuf {
        self.dir.join(DEFAULTS_FILE)
    }

    /// The launch presets file.
    pub fn launch_file(&self) -> PathBuf {
        self.dir.join(LAUNCH_FILE)
    }
}

pub fn home_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .context("Could not find home directory")
}
