//! Engine config persistence
//!
//! `engine.json` lives in the OxideTerm config directory unless
//! `OXIDETERM_ENGINE_CONFIG` points elsewhere.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::types::{EngineConfig, CONFIG_VERSION};

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "OXIDETERM_ENGINE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Cannot locate the user config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed engine config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Engine config version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// `~/.oxideterm` (or `%APPDATA%\OxideTerm` on Windows)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    let dir = dirs::config_dir()
        .map(|d| d.join("OxideTerm"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".oxideterm")));

    #[cfg(not(windows))]
    let dir = dirs::home_dir().map(|h| h.join(".oxideterm"));

    dir.ok_or(StorageError::NoConfigDir)
}

/// Resolved location of `engine.json`
pub fn engine_config_file() -> Result<PathBuf, StorageError> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(config_dir()?.join("engine.json")),
    }
}

/// Write `bytes` next to `path` and rename over it
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension("json.tmp");
    let mut file = fs::File::create(&staging).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&staging, path).await?;
    Ok(())
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the resolved default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(engine_config_file()?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Read the config. Missing file → defaults; unreadable JSON is
    /// quarantined and defaults are returned.
    pub async fn load(&self) -> Result<EngineConfig, StorageError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No engine config at {:?}, using defaults", self.path);
                return Ok(EngineConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: EngineConfig = match serde_json::from_slice(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Engine config {:?} unreadable: {}", self.path, e);
                match self.quarantine().await {
                    Ok(moved) => warn!("Moved unreadable config to {:?}", moved),
                    Err(qe) => error!("Failed to quarantine engine config: {}", qe),
                }
                return Ok(EngineConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::UnsupportedVersion {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    pub async fn save(&self, config: &EngineConfig) -> Result<(), StorageError> {
        let mut json = serde_json::to_vec_pretty(config)?;
        json.push(b'\n');
        write_atomic(&self.path, &json).await?;
        debug!("Engine config written to {:?}", self.path);
        Ok(())
    }

    /// Load, apply `edit`, save. Returns the saved config.
    pub async fn update<F>(&self, edit: F) -> Result<EngineConfig, StorageError>
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut config = self.load().await?;
        edit(&mut config);
        config.version = CONFIG_VERSION;
        self.save(&config).await?;
        Ok(config)
    }

    /// Rename the current file aside with a timestamp suffix
    pub async fn quarantine(&self) -> Result<PathBuf, StorageError> {
        let target = self.path.with_extension(format!(
            "json.corrupt-{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::rename(&self.path, &target).await?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("engine.json"));

        assert!(!storage.exists().await);
        assert_eq!(storage.load().await.unwrap(), EngineConfig::default());
    }

    #[tokio::test]
    async fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("a").join("b").join("engine.json"));

        let mut config = EngineConfig::default();
        config.sftp.max_sessions = 3;
        config.reconnect.max_retries = 8;
        storage.save(&config).await.unwrap();

        assert!(storage.exists().await);
        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, config);
        assert!(!dir.path().join("a/b/engine.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_unreadable_file_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = ConfigStorage::with_path(path.clone());

        assert_eq!(storage.load().await.unwrap(), EngineConfig::default());
        assert!(!path.exists());

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, format!(r#"{{"version":{}}}"#, CONFIG_VERSION + 1)).unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::UnsupportedVersion { found, .. } if found == CONFIG_VERSION + 1
        ));
    }

    #[tokio::test]
    async fn test_update_persists_edit() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("engine.json"));

        let saved = storage
            .update(|c| c.queue.readdir_delay_ms = 10)
            .await
            .unwrap();
        assert_eq!(saved.queue.readdir_delay_ms, 10);
        assert_eq!(storage.load().await.unwrap().queue.readdir_delay_ms, 10);
    }
}
