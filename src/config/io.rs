use std::env::{current_exe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use directories_next::{ProjectDirs};
use tokio::fs::{File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to <exe>.json in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\gcs-compass.exe => F:\gcs-compass.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to gcs-compass.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "gcs", "gcs-compass").map(|dirs| {
        dirs.config_dir().join("gcs-compass.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    let portable = get_portable_config_path();
    if let Some(path) = portable {
        match std::fs::metadata(&path) {
            Ok(attr) => {
                if attr.is_file() {
                    return Ok(path);
                }
            }
            Err(err) => {
                debug!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Exclusive for as long as the guard lives; a second instance gets `CanNotLock`.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    path: PathBuf,
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    /// Opens (creating if needed) `path`, or the default location when `path` is `None`.
    pub fn new_sync(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => get_config_path()?,
        };
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent().filter(|directory| !directory.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(&path)?;

        let inner = ConfigIOInner {
            path,
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    fn inner(&self) -> MutexGuard<'_, ConfigIOInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> PathBuf {
        self.inner().path.clone()
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(self.inner().file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let file = self.inner().file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        debug!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config to {}", self.path().to_string_lossy());

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::{MatchStrategy, PayloadLayout};

    #[tokio::test]
    async fn empty_file_reads_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gcs-compass.json");

        let io = ConfigIO::new_sync(Some(path.clone())).unwrap();

        assert!(path.is_file());
        assert_eq!(io.read().await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn save_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcs-compass.json");
        let io = ConfigIO::new_sync(Some(path.clone())).unwrap();

        let config = Config {
            device_name: "Nano33BLE".to_string(),
            name_match: MatchStrategy::Partial,
            payload_layout: PayloadLayout::Utf8,
            ..Config::default()
        };
        io.save(&config).await.unwrap();

        // shorter content must not leave a tail of the previous file behind
        io.save(&Config::default()).await.unwrap();
        io.save(&config).await.unwrap();

        assert_eq!(io.read().await.unwrap(), config);

        let reopened = ConfigIO::new_sync(Some(path)).unwrap();
        assert_eq!(reopened.read().await.unwrap(), config);
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcs-compass.json");
        std::fs::write(&path, "{ deviceName: ").unwrap();

        let io = ConfigIO::new_sync(Some(path)).unwrap();

        assert!(matches!(io.read().await, Err(ConfigError::JsonError { .. })));
    }

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcs-compass.json");

        let first = ConfigIO::new_sync(Some(path.clone())).unwrap();
        let mut first_locker = first.locker().unwrap();
        let _guard = first_locker.lock().unwrap();

        let second = ConfigIO::new_sync(Some(path)).unwrap();
        let mut second_locker = second.locker().unwrap();
        assert!(matches!(second_locker.lock(), Err(ConfigError::CanNotLock { .. })));
    }
}
