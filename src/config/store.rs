use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::CameraConfig;
use crate::error::{CameraError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` so the capture threads can read the live
/// configuration without taking a lock.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<CameraConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,
}

impl ConfigStore {
    /// Open the store, writing defaults if the file does not exist yet
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => CameraConfig::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No camera config at {}, writing defaults", path.display());
                let config = CameraConfig::default();
                Self::save(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);
        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    async fn save(path: &Path, config: &CameraConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Current configuration (lock-free)
    pub fn get(&self) -> Arc<CameraConfig> {
        self.cache.load_full()
    }

    /// Validate, persist, then publish a new configuration
    pub async fn set(&self, config: CameraConfig) -> Result<()> {
        config.validate()?;
        Self::save(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            path: self.path.clone(),
        });
        Ok(())
    }

    /// Read-modify-write with a closure; last writer wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CameraConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.set(config).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Load a configuration file without keeping a store around
pub fn load_file(path: &Path) -> Result<CameraConfig> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| CameraError::Config(format!("{}: {}", path.display(), e)))?;
    CameraConfig::from_json(&json)
}
