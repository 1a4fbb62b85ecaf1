//! Platform Bluetooth bindings
//! One contract, two implementations: bluest on desktop targets and Web
//! Bluetooth under wasm32. The concrete type is chosen at compile time.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::bluetooth::types::{
    AdapterState, DiscoveredDevice, GattEndpoint, GattSession, Notification, ScanMode,
};
use crate::core::rt::{MaybeSend, MaybeSync};

#[cfg(not(target_arch = "wasm32"))]
mod native;
#[cfg(target_arch = "wasm32")]
mod web;

#[cfg(not(target_arch = "wasm32"))]
pub use native::NativeBackend;
#[cfg(target_arch = "wasm32")]
pub use web::WebBackend;

/// The binding compiled into this build
#[cfg(not(target_arch = "wasm32"))]
pub type PlatformBackend = NativeBackend;
#[cfg(target_arch = "wasm32")]
pub type PlatformBackend = WebBackend;

/// Creates the binding for the current build target.
pub async fn create_platform_backend() -> Result<PlatformBackend> {
    PlatformBackend::new().await
}

/// Raw access to a host BLE stack.
///
/// Implementations emit events and never keep authoritative state; the
/// manager applies everything to the connection store.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait BleBackend: MaybeSend + MaybeSync + 'static {
    /// Asks the platform for Bluetooth access. `Ok(false)` means refused.
    async fn request_permissions(&self) -> Result<bool>;

    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Stream of adapter state transitions for the lifetime of the backend.
    async fn adapter_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterState>>;

    /// Starts discovery. The receiver closes when the platform ends the scan
    /// or `stop_scan` is called.
    async fn start_scan(&self, mode: ScanMode) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>>;

    /// Stops discovery. Safe to call with no scan running.
    async fn stop_scan(&self) -> Result<()>;

    /// Connects and discovers services and characteristics.
    async fn connect(&self, id: &str) -> Result<GattSession>;

    /// Arms notifications on one characteristic, forwarding values into `sink`.
    async fn subscribe(
        &self,
        id: &str,
        endpoint: GattEndpoint,
        sink: mpsc::UnboundedSender<Notification>,
    ) -> Result<()>;

    /// Tears down the link and every subscription on it. Unknown or already
    /// disconnected ids are not an error.
    async fn disconnect(&self, id: &str) -> Result<()>;

    async fn is_connected(&self, id: &str) -> bool;
}
