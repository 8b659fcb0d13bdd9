//! Holds the authoritative configuration value and persists it.

use super::{default_config, ConfigError, HostsConfig};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

/// Reader-writer guarded configuration bound to its file on disk.
///
/// Readers take shared access; mutations take exclusive access for the
/// mutation plus the persist that follows it. A mutation is applied to a
/// working copy and validated before it replaces the held value, so an
/// operation that would corrupt the document leaves the store untouched.
pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<HostsConfig>,
    // Serialized form of the last save, used to tell our own writes apart
    // from out-of-band edits when the watcher fires.
    last_written: Mutex<Option<String>>,
}

impl ConfigStore {
    /// Loads and validates the configuration file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = read_config(&path)?;
        Ok(Self {
            path,
            config: RwLock::new(config),
            last_written: Mutex::new(None),
        })
    }

    /// Loads the configuration, writing the default document first if the
    /// file does not exist yet.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            write_default(&path)?;
            info!(path = %path.display(), "created default configuration");
        }
        Self::load(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared access for readers.
    pub async fn read(&self) -> RwLockReadGuard<'_, HostsConfig> {
        self.config.read().await
    }

    /// Clone of the current value, for work done outside the lock.
    pub async fn snapshot(&self) -> HostsConfig {
        self.config.read().await.clone()
    }

    /// Applies a mutation, validates the result, swaps it in and persists.
    ///
    /// A failed persist still leaves the mutated value as the in-memory
    /// authority; the caller decides how to surface the error.
    pub async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut HostsConfig) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let mut guard = self.config.write().await;
        let mut candidate = guard.clone();
        let out = f(&mut candidate)?;
        candidate.validate()?;
        *guard = candidate;
        self.persist(&guard)?;
        Ok(out)
    }

    /// Re-reads the file, validates it, and swaps the value in.
    ///
    /// Returns `Ok(false)` when the file content matches the store's own
    /// last save, so a save does not bounce back through the watcher as a
    /// spurious external change. An invalid or unreadable file leaves the
    /// current value in place.
    pub async fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let raw = std::fs::read_to_string(&self.path).map_err(ConfigError::Read)?;
        if self
            .last_written
            .lock()
            .expect("last_written mutex poisoned")
            .as_deref()
            == Some(raw.as_str())
        {
            debug!("config change event matches our own save, skipping");
            return Ok(false);
        }

        let config: HostsConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;

        let mut guard = self.config.write().await;
        *guard = config;
        info!(path = %self.path.display(), "configuration reloaded from disk");
        Ok(true)
    }

    fn persist(&self, config: &HostsConfig) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(config)?;
        std::fs::write(&self.path, &yaml).map_err(ConfigError::Write)?;
        *self
            .last_written
            .lock()
            .expect("last_written mutex poisoned") = Some(yaml);
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<HostsConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    let config: HostsConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

fn write_default(path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(ConfigError::Write)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755));
        }
    }
    let yaml = serde_yaml::to_string(&default_config())?;
    std::fs::write(path, yaml).map_err(ConfigError::Write)
}
