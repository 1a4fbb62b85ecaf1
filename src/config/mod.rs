use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    CONNECT_RETRY_DELAY_MS, DEFAULT_MIN_RSSI, DEFAULT_SCAN_DURATION_MS, MAX_CONNECT_RETRIES,
};

/// Directory name under the platform config dir
pub const APP_DIR_NAME: &str = "ptt-headset-bridge";

#[cfg(not(target_arch = "wasm32"))]
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Default scan duration when the caller gives none
    pub scan_duration_ms: u64,
    /// Strong-signal gate for normal scans (dBm, inclusive)
    pub min_rssi: i16,
    /// Connect to the preferred device when a scan finds it
    pub auto_connect_preferred: bool,
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_duration_ms: DEFAULT_SCAN_DURATION_MS,
            min_rssi: DEFAULT_MIN_RSSI,
            auto_connect_preferred: true,
            connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `log` level filter, e.g. "info" or "debug". `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bluetooth: BluetoothConfig,
    pub logging: LoggingConfig,
}

#[cfg(not(target_arch = "wasm32"))]
mod file {
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use log::{error, info, warn};
    use tokio::fs;

    use super::{AppConfig, CONFIG_FILE_NAME};
    use crate::utils::{app_config_dir, ensure_directory_exists};

    impl AppConfig {
        pub fn default_path() -> Result<PathBuf> {
            Ok(app_config_dir()?.join(CONFIG_FILE_NAME))
        }

        /// Loads the config from the application config directory.
        pub async fn load_config() -> Result<Self> {
            Self::load_from(&Self::default_path()?).await
        }

        /// Saves the config to the application config directory.
        pub async fn save_config(&self) -> Result<()> {
            self.save_to(&Self::default_path()?).await
        }

        pub async fn load_from(file_path: &Path) -> Result<Self> {
            if !file_path.exists() {
                warn!("Config file not found at {:?}, using default.", file_path);
                return Ok(Self::default());
            }

            let config_json = fs::read_to_string(file_path).await?;
            let config: Self = serde_json::from_str(&config_json)?;

            info!("Config loaded from {:?}", file_path);
            Ok(config)
        }

        pub async fn save_to(&self, file_path: &Path) -> Result<()> {
            if let Some(parent) = file_path.parent() {
                ensure_directory_exists(parent).await?;
            }

            let config_json = match serde_json::to_string_pretty(self) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize config to JSON: {}", e);
                    return Err(e.into());
                }
            };

            fs::write(file_path, config_json).await?;

            info!("Config saved to {:?}.", file_path);
            Ok(())
        }
    }
}
