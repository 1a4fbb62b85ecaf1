//! Application state management
//! Builds the store, the routing bridge and the accessory manager once at
//! start-up and hands them to whatever composes the voice-call feature.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::config::AppConfig;
use crate::core::bluetooth::backend::{BleBackend, PlatformBackend, create_platform_backend};
use crate::core::bluetooth::{AccessoryManager, ConnectionStore};
use crate::core::preferences::{MemoryPreferenceStore, PreferenceStore};
use crate::core::routing::AudioRoutingBridge;

/// Application state
pub struct AppState<B: BleBackend = PlatformBackend> {
    pub config: AppConfig,
    pub store: ConnectionStore,
    pub bridge: AudioRoutingBridge,
    pub manager: AccessoryManager<B>,
}

impl AppState<PlatformBackend> {
    /// Creates a new AppState on the platform's Bluetooth stack
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing AccessoryManager...");
        let backend = create_platform_backend().await?;
        Ok(Self::with_backend(backend, config, default_preferences()))
    }
}

impl<B: BleBackend> AppState<B> {
    pub fn with_backend(backend: B, config: AppConfig, preferences: Arc<dyn PreferenceStore>) -> Self {
        let store = ConnectionStore::new();
        let bridge = AudioRoutingBridge::new(store.clone());
        let manager = AccessoryManager::new(
            backend,
            store.clone(),
            bridge.clone(),
            preferences,
            config.bluetooth.clone(),
        );
        Self {
            config,
            store,
            bridge,
            manager,
        }
    }

    /// Gets a handle to the accessory manager
    pub fn manager(&self) -> AccessoryManager<B> {
        self.manager.clone()
    }
}

/// The persistent preference store for this target, or an in-memory one
/// when none is available.
pub fn default_preferences() -> Arc<dyn PreferenceStore> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        match crate::core::preferences::JsonFilePreferenceStore::in_config_dir() {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!("Preferences will not persist: {}", e),
        }
    }
    #[cfg(target_arch = "wasm32")]
    {
        if web_sys::window().is_some() {
            return Arc::new(crate::core::preferences::LocalStoragePreferenceStore);
        }
        warn!("Preferences will not persist: no window");
    }
    Arc::new(MemoryPreferenceStore::new())
}
