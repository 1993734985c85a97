//! Layered settings: built-in defaults, then an optional TOML file, then
//! environment variables. Command-line flags are applied last by the binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{DEFAULT_BATCH_SIZE, default_workers};
use crate::error::{CatalogError, Result};
use crate::external::FFMPEG_ENV_VAR;
use crate::loudness::DEFAULT_TARGET_LUFS;

pub const CONFIG_ENV_VAR: &str = "VDJ_CATALOG_CONFIG";
pub const DATABASE_ENV_VAR: &str = "VDJ_DATABASE_PATH";
pub const BACKUP_DIR_ENV_VAR: &str = "VDJ_BACKUP_DIR";
pub const CHECKPOINT_DIR_ENV_VAR: &str = "VDJ_CHECKPOINT_DIR";
pub const CACHE_PATH_ENV_VAR: &str = "VDJ_CACHE_PATH";

/// `<config_dir>/vdj-catalog/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vdj-catalog").join("config.toml"))
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library/Application Support/VirtualDJ/database.xml")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub cache_path: PathBuf,
    pub ffmpeg_path: String,
    pub batch_size: usize,
    pub workers: usize,
    pub target_lufs: f64,
    /// Source prefix -> replacement prefix, e.g. `"D:/Main/" = "/Volumes/Music/Main/"`.
    pub path_mappings: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            backup_dir: crate::backup::default_dir(),
            checkpoint_dir: crate::checkpoint::default_dir(),
            cache_path: crate::cache::default_path(),
            ffmpeg_path: "ffmpeg".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers: default_workers(),
            target_lufs: DEFAULT_TARGET_LUFS,
            path_mappings: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Defaults, the config file, and the process environment.
    ///
    /// A file named by `$VDJ_CATALOG_CONFIG` must exist; the default
    /// location is optional.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_ENV_VAR)
            .ok()
            .map(|v| PathBuf::from(v.trim()))
            .filter(|p| !p.as_os_str().is_empty());
        Self::load_from(explicit.as_deref())
    }

    /// Like `load`, with the config file given by the caller. `None` falls
    /// back to the default location if a file exists there.
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|path| path.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CatalogError::from_io(path, e))?;
        let config = Self::from_toml_str(&text)
            .map_err(|e| CatalogError::corrupt(format!("config {}", path.display()), e.to_string()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override paths from `VDJ_*` variables. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(path) = get(DATABASE_ENV_VAR) {
            self.database_path = path.into();
        }
        if let Some(path) = get(BACKUP_DIR_ENV_VAR) {
            self.backup_dir = path.into();
        }
        if let Some(path) = get(CHECKPOINT_DIR_ENV_VAR) {
            self.checkpoint_dir = path.into();
        }
        if let Some(path) = get(CACHE_PATH_ENV_VAR) {
            self.cache_path = path.into();
        }
        if let Some(path) = get(FFMPEG_ENV_VAR) {
            self.ffmpeg_path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CatalogError::ValidationFailed("batch_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(CatalogError::ValidationFailed("workers must be at least 1".into()));
        }
        if !self.target_lufs.is_finite() || self.target_lufs > 0.0 {
            return Err(CatalogError::ValidationFailed(format!(
                "target_lufs must be a negative number, got {}",
                self.target_lufs
            )));
        }
        Ok(())
    }
}
