//! Preferred-device persistence
//! A small key-value provider abstraction plus the helpers that read and
//! write the preferred accessory through it.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};

use crate::core::bluetooth::constants::PREFERRED_DEVICE_KEY;
use crate::core::bluetooth::types::PreferredDevice;
use crate::core::rt::{MaybeSend, MaybeSync};

/// String key-value storage provided by the host
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait PreferenceStore: MaybeSend + MaybeSync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes `value`, or removes the key when `None`.
    async fn set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// Reads the preferred device. A malformed entry is treated as absent.
pub async fn load_preferred_device(store: &dyn PreferenceStore) -> Result<Option<PreferredDevice>> {
    let Some(raw) = store.get(PREFERRED_DEVICE_KEY).await? else {
        return Ok(None);
    };
    match serde_json::from_str::<Option<PreferredDevice>>(&raw) {
        Ok(device) => Ok(device),
        Err(e) => {
            warn!("Ignoring unreadable preferred device entry: {}", e);
            Ok(None)
        }
    }
}

/// Replaces the stored preferred device.
pub async fn save_preferred_device(store: &dyn PreferenceStore, device: Option<&PreferredDevice>) -> Result<()> {
    match device {
        Some(device) => {
            let json = serde_json::to_string(device)?;
            store.set(PREFERRED_DEVICE_KEY, Some(&json)).await?;
            info!("Preferred device saved: {} ({})", device.name, device.id);
        }
        None => {
            store.set(PREFERRED_DEVICE_KEY, None).await?;
            info!("Preferred device cleared");
        }
    }
    Ok(())
}

/// Process-lifetime storage, used in tests and when no persistent store is wired
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| anyhow!("preference store poisoned"))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| anyhow!("preference store poisoned"))?;
        match value {
            Some(value) => values.insert(key.to_string(), value.to_string()),
            None => values.remove(key),
        };
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use file::JsonFilePreferenceStore;

#[cfg(not(target_arch = "wasm32"))]
mod file {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use anyhow::Result;
    use async_trait::async_trait;
    use log::{error, info, warn};
    use tokio::fs;
    use tokio::sync::Mutex;

    use super::PreferenceStore;
    use crate::utils::ensure_directory_exists;

    const PREFERENCES_FILE_NAME: &str = "preferences.json";

    /// All keys in one pretty-printed JSON object on disk
    #[derive(Debug)]
    pub struct JsonFilePreferenceStore {
        path: PathBuf,
        /// Serializes read-modify-write cycles
        lock: Mutex<()>,
    }

    impl JsonFilePreferenceStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                lock: Mutex::new(()),
            }
        }

        /// Store at `preferences.json` in the application config directory.
        pub fn in_config_dir() -> Result<Self> {
            Ok(Self::new(crate::utils::app_config_dir()?.join(PREFERENCES_FILE_NAME)))
        }

        async fn read_all(&self) -> Result<HashMap<String, String>> {
            if !self.path.exists() {
                return Ok(HashMap::new());
            }
            let json = fs::read_to_string(&self.path).await?;
            match serde_json::from_str(&json) {
                Ok(values) => Ok(values),
                Err(e) => {
                    warn!("Preferences file {:?} is corrupt, starting empty: {}", self.path, e);
                    Ok(HashMap::new())
                }
            }
        }
    }

    #[async_trait]
    impl PreferenceStore for JsonFilePreferenceStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let _guard = self.lock.lock().await;
            Ok(self.read_all().await?.remove(key))
        }

        async fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
            let _guard = self.lock.lock().await;
            let mut values = self.read_all().await?;
            match value {
                Some(value) => values.insert(key.to_string(), value.to_string()),
                None => values.remove(key),
            };

            if let Some(parent) = self.path.parent() {
                ensure_directory_exists(parent).await?;
            }
            let json = match serde_json::to_string_pretty(&values) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize preferences to JSON: {}", e);
                    return Err(e.into());
                }
            };
            fs::write(&self.path, json).await?;
            info!("Preferences saved to {:?}.", self.path);
            Ok(())
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use local_storage::LocalStoragePreferenceStore;

#[cfg(target_arch = "wasm32")]
mod local_storage {
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    use super::PreferenceStore;

    /// Browser `localStorage`
    #[derive(Debug, Default)]
    pub struct LocalStoragePreferenceStore;

    impl LocalStoragePreferenceStore {
        fn storage() -> Result<web_sys::Storage> {
            web_sys::window()
                .and_then(|window| window.local_storage().ok().flatten())
                .ok_or_else(|| anyhow!("localStorage is not available"))
        }
    }

    #[async_trait(?Send)]
    impl PreferenceStore for LocalStoragePreferenceStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Self::storage()?
                .get_item(key)
                .map_err(|e| anyhow!("localStorage read failed: {:?}", e))
        }

        async fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
            let storage = Self::storage()?;
            let result = match value {
                Some(value) => storage.set_item(key, value),
                None => storage.remove_item(key),
            };
            result.map_err(|e| anyhow!("localStorage write failed: {:?}", e))
        }
    }
}
