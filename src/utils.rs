use std::path::Path;

use anyhow::Result;
use log::{error, info};
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Directory holding this application's config and preference files.
pub fn app_config_dir() -> Result<std::path::PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(crate::config::APP_DIR_NAME))
        .ok_or_else(|| anyhow::anyhow!("No config directory on this platform"))
}
