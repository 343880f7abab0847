//! On-disk configuration (`config.toml`).

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::error::{Result, StoreError};
use crate::metadata::JsonStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "tstore";
const CONFIG_FILE: &str = "config.toml";

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_backup_debounce_secs() -> u64 {
    60
}

fn default_stability_delay_ms() -> u64 {
    1000
}

fn default_destination() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Managed folder; Local files live here
    pub sync_folder: PathBuf,

    /// Chat that receives chunks and metadata backups
    #[serde(default = "default_destination")]
    pub destination: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_backup_debounce_secs")]
    pub backup_debounce_secs: u64,

    #[serde(default = "default_stability_delay_ms")]
    pub stability_delay_ms: u64,

    /// Root of the directory-backed remote
    pub remote_dir: PathBuf,

    /// Metadata index location; defaults to `metadata.json` next to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data = dirs::data_dir().unwrap_or_else(|| home.clone());
        Self {
            sync_folder: home.join("TStore"),
            destination: default_destination(),
            chunk_size: default_chunk_size(),
            backup_debounce_secs: default_backup_debounce_secs(),
            stability_delay_ms: default_stability_delay_ms(),
            remote_dir: data.join(CONFIG_DIR).join("remote"),
            metadata_path: None,
        }
    }
}

impl Config {
    /// `<config dir>/tstore/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            StoreError::Config("Cannot determine config directory".to_string())
        })?;
        Ok(dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Read `path`, writing the defaults there first if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }

        let text = fs::read_to_string(path).map_err(|e| StoreError::io("read", path, e))?;
        toml::from_str(&text)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }

        let text = toml::to_string_pretty(self)
            .map_err(|e| StoreError::Config(format!("encode config: {e}")))?;
        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, text).map_err(|e| StoreError::io("write", &temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io("rename", &temp_path, e));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StoreError::Config("chunk_size must be positive".to_string()));
        }
        if self.destination.trim().is_empty() {
            return Err(StoreError::Config("destination must not be empty".to_string()));
        }
        if !self.sync_folder.is_dir() {
            return Err(StoreError::Config(format!(
                "sync folder {} is not a directory",
                self.sync_folder.display()
            )));
        }
        Ok(())
    }

    /// Index location, falling back to the default next to the config file.
    pub fn metadata_path(&self) -> Result<PathBuf> {
        match &self.metadata_path {
            Some(path) => Ok(path.clone()),
            None => JsonStore::default_path(),
        }
    }

    pub fn backup_debounce(&self) -> Duration {
        Duration::from_secs(self.backup_debounce_secs)
    }

    pub fn stability_delay(&self) -> Duration {
        Duration::from_millis(self.stability_delay_ms)
    }
}
