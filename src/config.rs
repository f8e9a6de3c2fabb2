//! Cache configuration.
//!
//! Handles loading and parsing an optional `darkroom.toml`. Configuration
//! is optional — sensible defaults are used when no config file exists.
//!
//! ```toml
//! # All options are optional - defaults shown below, relative paths
//! # resolve against the file's own directory.
//!
//! [paths]
//! cache_top = "blobs"   # content-addressed blob directory
//! store_dir = "state"   # derivation map (checkpoint + journal)
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Cache configuration loaded from `darkroom.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub paths: PathsConfig,
}

/// Where the cache keeps its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub cache_top: PathBuf,
    pub store_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_top: PathBuf::from("blobs"),
            store_dir: PathBuf::from("state"),
        }
    }
}

impl CacheConfig {
    /// Load from a TOML file. Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load `darkroom.toml` from a directory, resolving relative paths
    /// against that directory.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(&dir.join("darkroom.toml"))?;
        config.paths.cache_top = resolve(dir, config.paths.cache_top);
        config.paths.store_dir = resolve(dir, config.paths.store_dir);
        Ok(config)
    }
}

fn resolve(dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        dir.join(path)
    }
}
