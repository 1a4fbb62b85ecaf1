//! Accessory manager for the PTT headset bridge
//! This module provides the main interface for accessory operations:
//! scanning, connecting, disconnecting and the adapter state machine. It
//! drives a platform backend and applies every outcome to the store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BluetoothConfig;
use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::classifier::{admit, describe};
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::protocol::{self, Vendor};
use crate::core::bluetooth::scanner::{BluetoothScanner, ScanEnd, run_scan_session};
use crate::core::bluetooth::store::ConnectionStore;
use crate::core::bluetooth::types::{
    AdapterState, AudioAccessory, ButtonEvent, DiscoveredDevice, LinkEvent, PreferredDevice,
    ScanMode,
};
use crate::core::preferences::{PreferenceStore, load_preferred_device, save_preferred_device};
use crate::core::routing::AudioRoutingBridge;
use crate::core::rt;
use crate::error::AccessoryError;

/// The established link and everything that must stop with it
struct ActiveLink {
    id: String,
    epoch: u64,
    cancel: CancellationToken,
}

struct ManagerInner<B> {
    backend: B,
    store: ConnectionStore,
    bridge: AudioRoutingBridge,
    preferences: Arc<dyn PreferenceStore>,
    config: BluetoothConfig,
    scanner: BluetoothScanner,
    connection: ConnectionManager,
    notifications: NotificationHandler,
    /// Bumped by every disconnect; a connect only publishes if it is unchanged.
    epoch: AtomicU64,
    connecting: AtomicBool,
    initialized: AtomicBool,
    auto_connect_latched: AtomicBool,
    /// A scan is running on behalf of the auto-connect attempt.
    auto_connect_pending: AtomicBool,
    adapter_went_off: AtomicBool,
    link: Mutex<Option<ActiveLink>>,
    preference_writes: tokio::sync::Mutex<()>,
    lifetime: CancellationToken,
}

/// Manages accessory discovery and the connection lifecycle
pub struct AccessoryManager<B: BleBackend> {
    inner: Arc<ManagerInner<B>>,
}

impl<B: BleBackend> Clone for AccessoryManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Clears the connecting flag on every exit path of a connect attempt.
struct ConnectingGuard<'a> {
    flag: &'a AtomicBool,
    store: &'a ConnectionStore,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.store.set_connecting(false);
    }
}

impl<B: BleBackend> AccessoryManager<B> {
    pub fn new(
        backend: B,
        store: ConnectionStore,
        bridge: AudioRoutingBridge,
        preferences: Arc<dyn PreferenceStore>,
        config: BluetoothConfig,
    ) -> Self {
        let connection = ConnectionManager::new(config.connect_retries, config.connect_retry_delay_ms);
        let notifications = NotificationHandler::new(store.clone(), bridge.clone());
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                store,
                bridge,
                preferences,
                config,
                scanner: BluetoothScanner::new(),
                connection,
                notifications,
                epoch: AtomicU64::new(0),
                connecting: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                auto_connect_latched: AtomicBool::new(false),
                auto_connect_pending: AtomicBool::new(false),
                adapter_went_off: AtomicBool::new(false),
                link: Mutex::new(None),
                preference_writes: tokio::sync::Mutex::new(()),
                lifetime: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &ConnectionStore {
        &self.inner.store
    }

    pub fn bridge(&self) -> &AudioRoutingBridge {
        &self.inner.bridge
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Loads the preferred device, reads the adapter state and starts
    /// following adapter transitions. Safe to call more than once.
    pub async fn initialize(&self) -> Result<(), AccessoryError> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Initializing accessory manager...");

        match load_preferred_device(self.inner.preferences.as_ref()).await {
            Ok(preferred) => {
                if let Some(device) = &preferred {
                    info!("Preferred device: {} ({})", device.name, device.id);
                }
                self.inner.store.set_preferred_device(preferred);
            }
            Err(e) => warn!("Could not load preferred device: {}", e),
        }

        let state = self
            .inner
            .backend
            .adapter_state()
            .await
            .map_err(AccessoryError::backend)?;
        self.inner.store.set_adapter_state(state);
        info!("Bluetooth adapter is {}", state);

        let mut events = self
            .inner
            .backend
            .adapter_events()
            .await
            .map_err(AccessoryError::backend)?;
        let manager = self.clone();
        let lifetime = self.inner.lifetime.clone();
        rt::spawn(async move {
            loop {
                tokio::select! {
                    _ = lifetime.cancelled() => break,
                    next = events.recv() => match next {
                        Some(state) => manager.handle_adapter_state(state).await,
                        None => break,
                    },
                }
            }
            debug!("Adapter watcher stopped");
        });

        self.maybe_auto_connect().await;
        Ok(())
    }

    pub async fn request_permissions(&self) -> Result<bool, AccessoryError> {
        let granted = self
            .inner
            .backend
            .request_permissions()
            .await
            .map_err(AccessoryError::backend)?;
        self.inner.store.set_permissions_granted(granted);
        if granted {
            info!("Bluetooth permissions granted");
            self.maybe_auto_connect().await;
        } else {
            warn!("Bluetooth permissions denied");
        }
        Ok(granted)
    }

    /// Queries the adapter and applies the result, teardown included.
    pub async fn check_adapter_state(&self) -> Result<AdapterState, AccessoryError> {
        let state = self
            .inner
            .backend
            .adapter_state()
            .await
            .map_err(AccessoryError::backend)?;
        self.handle_adapter_state(state).await;
        Ok(state)
    }

    /// Applies an adapter transition.
    ///
    /// Off or unauthorized adapters cannot be trusted to report a clean
    /// disconnect, so the scan, the link and the device list are torn down
    /// here. Coming back on after being off re-arms the auto-connect latch.
    pub async fn handle_adapter_state(&self, state: AdapterState) {
        let previous = self.inner.store.adapter_state();
        self.inner.store.set_adapter_state(state);
        if previous != state {
            info!("Bluetooth adapter state: {} -> {}", previous, state);
        }

        if state.requires_teardown() {
            self.inner.adapter_went_off.store(true, Ordering::SeqCst);
            self.inner.auto_connect_pending.store(false, Ordering::SeqCst);
            if let Err(e) = self.stop_scanning().await {
                warn!("Failed to stop scan during teardown: {}", e);
            }
            if let Err(e) = self.disconnect_device().await {
                warn!("Failed to disconnect during teardown: {}", e);
            }
            self.inner.store.clear_devices();
            return;
        }

        if state.is_powered_on() {
            if self.inner.adapter_went_off.swap(false, Ordering::SeqCst) {
                info!("Adapter cycled back on, auto-connect re-armed");
                self.inner.auto_connect_latched.store(false, Ordering::SeqCst);
            }
            self.maybe_auto_connect().await;
        }
    }

    fn ensure_ready(&self) -> Result<(), AccessoryError> {
        if !self.inner.store.permissions_granted() {
            return Err(AccessoryError::PermissionDenied);
        }
        let state = self.inner.store.adapter_state();
        if !state.is_powered_on() {
            return Err(AccessoryError::AdapterUnavailable(state));
        }
        Ok(())
    }

    /// Starts a filtered scan. No-op if one is already running.
    pub async fn start_scanning(&self, duration_ms: Option<u64>) -> Result<(), AccessoryError> {
        self.start_scan_with(ScanMode::Normal, duration_ms).await
    }

    /// Starts an unfiltered scan for field diagnostics.
    pub async fn start_debug_scanning(&self, duration_ms: Option<u64>) -> Result<(), AccessoryError> {
        self.start_scan_with(ScanMode::Debug, duration_ms).await
    }

    async fn start_scan_with(&self, mode: ScanMode, duration_ms: Option<u64>) -> Result<(), AccessoryError> {
        self.ensure_ready()?;

        let Some((scan_id, cancel)) = self.inner.scanner.begin() else {
            debug!("Scan already in progress, ignoring start request");
            return Ok(());
        };

        let store = &self.inner.store;
        store.clear_devices();
        if let Some(connected) = store.connected_device() {
            store.add_device(connected);
        }
        store.set_scanning(true);
        store.clear_connection_error();

        let discoveries = match self.inner.backend.start_scan(mode).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                if self.inner.scanner.finish(scan_id) {
                    store.set_scanning(false);
                }
                return Err(AccessoryError::backend(e));
            }
        };

        let duration = Duration::from_millis(duration_ms.unwrap_or(self.inner.config.scan_duration_ms));
        info!("Device scan started ({:?}, {:?})", mode, duration);

        let manager = self.clone();
        rt::spawn(async move {
            let collector = manager.clone();
            let end = run_scan_session(discoveries, cancel, duration, move |device| {
                collector.on_discovered(device, mode)
            })
            .await;

            if end != ScanEnd::Cancelled {
                if let Err(e) = manager.inner.backend.stop_scan().await {
                    warn!("Platform stop scan failed: {}", e);
                }
            }
            if manager.inner.scanner.finish(scan_id) {
                manager.inner.store.set_scanning(false);
                info!("Scan complete ({:?})", end);
            }
            manager.inner.auto_connect_pending.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    fn on_discovered(&self, device: DiscoveredDevice, mode: ScanMode) {
        let Some(accessory) = admit(device, mode, self.inner.config.min_rssi) else {
            return;
        };
        debug!(
            "Found accessory {} ({}) RSSI {:?}",
            accessory.name, accessory.id, accessory.rssi
        );
        let id = accessory.id.clone();
        self.inner.store.add_device(accessory);

        let is_preferred = self
            .inner
            .store
            .preferred_device()
            .is_some_and(|preferred| preferred.id == id);
        if is_preferred && self.inner.auto_connect_pending.swap(false, Ordering::SeqCst) {
            info!("Preferred device {} found, auto-connecting", id);
            let manager = self.clone();
            rt::spawn(async move {
                let _ = manager.stop_scanning().await;
                if let Err(e) = manager.connect_to_device(&id).await {
                    warn!("Auto-connect to {} failed: {}", id, e);
                }
            });
        }
    }

    /// Stops the current scan. Safe to call with no scan running.
    pub async fn stop_scanning(&self) -> Result<(), AccessoryError> {
        if self.inner.scanner.cancel() {
            info!("Stopping Bluetooth scan.");
            if let Err(e) = self.inner.backend.stop_scan().await {
                warn!("Platform stop scan failed: {}", e);
            }
        }
        self.inner.store.set_scanning(false);
        Ok(())
    }

    /// One auto-connect attempt per latch cycle.
    async fn maybe_auto_connect(&self) {
        if !self.inner.config.auto_connect_preferred {
            return;
        }
        let store = &self.inner.store;
        let Some(preferred) = store.preferred_device() else {
            return;
        };
        if store.connected_device().is_some() || self.ensure_ready().is_err() {
            return;
        }
        if self.inner.auto_connect_latched.swap(true, Ordering::SeqCst) {
            return;
        }

        if store.device(&preferred.id).is_some() {
            info!("Auto-connecting to preferred device {}", preferred.id);
            let manager = self.clone();
            rt::spawn(async move {
                if let Err(e) = manager.connect_to_device(&preferred.id).await {
                    warn!("Auto-connect to {} failed: {}", preferred.id, e);
                }
            });
            return;
        }

        info!("Scanning for preferred device {}", preferred.id);
        self.inner.auto_connect_pending.store(true, Ordering::SeqCst);
        if let Err(e) = self.start_scanning(None).await {
            warn!("Auto-connect scan failed: {}", e);
            self.inner.auto_connect_pending.store(false, Ordering::SeqCst);
        }
    }

    fn fail(&self, error: AccessoryError) -> AccessoryError {
        self.inner.store.set_connection_error(error.to_string());
        error
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) != epoch
    }

    /// Connects, subscribes to the button characteristics, routes audio and
    /// only then publishes the device as connected.
    ///
    /// A routing failure is returned to the caller but leaves the link up.
    pub async fn connect_to_device(&self, id: &str) -> Result<AudioAccessory, AccessoryError> {
        self.ensure_ready()?;
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            return Err(AccessoryError::ConnectInProgress);
        }
        let _guard = ConnectingGuard {
            flag: &self.inner.connecting,
            store: &self.inner.store,
        };
        self.inner.store.set_connecting(true);

        let mut epoch = self.inner.epoch.load(Ordering::SeqCst);

        if let Some(current) = self.inner.store.connected_device() {
            if current.id == id {
                info!("Device already connected.");
                return Ok(current);
            }
            info!("Releasing {} before connecting to {}", current.id, id);
            // The switch bumps the epoch itself; any other bump is a disconnect request.
            let released = self.with_link(|slot| {
                if self.superseded(epoch) {
                    return None;
                }
                self.inner.epoch.store(epoch + 1, Ordering::SeqCst);
                Some(slot.take())
            });
            let Some(previous) = released else {
                info!("Connect to {} superseded by a disconnect", id);
                return Err(AccessoryError::Superseded);
            };
            epoch += 1;
            match previous {
                Some(link) => self.release(link).await,
                None => self.inner.store.set_connected_device(None),
            }
        }

        let backend = &self.inner.backend;

        let session = self
            .inner
            .connection
            .connect_with_retry(backend, id)
            .await
            .map_err(|e| self.fail(AccessoryError::connection(e)))?;
        let mut link_events = session.link_events;

        if self.superseded(epoch) {
            info!("Connect to {} superseded by a disconnect", id);
            let _ = backend.disconnect(id).await;
            return Err(AccessoryError::Superseded);
        }

        let (sink, notifications) = mpsc::unbounded_channel();
        if let Err(e) = self
            .inner
            .connection
            .arm_button_subscriptions(backend, id, &session.endpoints, &sink)
            .await
        {
            let _ = backend.disconnect(id).await;
            return Err(self.fail(AccessoryError::connection(e)));
        }
        drop(sink);

        let accessory = self.accessory_record(id);
        let routing = self.inner.bridge.on_connected(&accessory).await;

        // Checked and published under the link lock that disconnects bump the epoch under.
        let cancel = CancellationToken::new();
        let published = self.with_link(|slot| {
            if self.superseded(epoch) {
                return false;
            }
            *slot = Some(ActiveLink {
                id: id.to_string(),
                epoch,
                cancel: cancel.clone(),
            });
            self.inner.store.set_connected_device(Some(accessory.clone()));
            true
        });
        if !published {
            info!("Connect to {} superseded by a disconnect", id);
            let _ = backend.disconnect(id).await;
            if let Err(e) = self.inner.bridge.on_disconnected().await {
                warn!("Audio revert failed: {}", e);
            }
            return Err(AccessoryError::Superseded);
        }
        self.inner.store.clear_connection_error();
        self.inner.auto_connect_pending.store(false, Ordering::SeqCst);
        self.inner.auto_connect_latched.store(true, Ordering::SeqCst);
        info!("Device {} successfully connected", id);

        self.inner.notifications.start(notifications, cancel.clone());

        let manager = self.clone();
        let link_id = id.to_string();
        rt::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                event = link_events.recv() => {
                    if event == Some(LinkEvent::Disconnected) {
                        manager.handle_link_lost(&link_id, epoch).await;
                    }
                }
            }
        });

        let preferred = PreferredDevice::new(accessory.id.clone(), accessory.name.clone());
        if self.inner.store.preferred_device().as_ref() != Some(&preferred) {
            if let Err(e) = self.set_preferred_device(Some(preferred)).await {
                warn!("Could not remember preferred device: {}", e);
            }
        }

        match routing {
            Ok(()) => Ok(accessory),
            Err(e) => {
                error!("Audio routing failed for {}: {}", id, e);
                Err(self.fail(e))
            }
        }
    }

    /// The scan record for `id`, or a minimal one for devices never scanned.
    fn accessory_record(&self, id: &str) -> AudioAccessory {
        if let Some(accessory) = self.inner.store.device(id) {
            return accessory;
        }
        let name = self
            .inner
            .store
            .preferred_device()
            .filter(|preferred| preferred.id == id)
            .map(|preferred| preferred.name);
        describe(DiscoveredDevice::new(id, name, None))
    }

    /// Runs `f` on the link slot. The epoch only changes while this lock is held.
    fn with_link<R>(&self, f: impl FnOnce(&mut Option<ActiveLink>) -> R) -> R {
        let mut slot = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut slot)
    }

    /// Disconnects the current device. Nothing connected is not an error.
    pub async fn disconnect_device(&self) -> Result<(), AccessoryError> {
        let link = self.with_link(|slot| {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        });

        match link {
            Some(link) => self.release(link).await,
            None => self.inner.store.set_connected_device(None),
        }
        Ok(())
    }

    /// Tears down a link already taken out of the slot.
    async fn release(&self, link: ActiveLink) {
        link.cancel.cancel();

        if let Err(e) = self.inner.connection.disconnect(&self.inner.backend, &link.id).await {
            warn!("Platform disconnect of {} failed: {}", link.id, e);
        }
        self.inner.store.set_connected_device(None);
        if let Err(e) = self.inner.bridge.on_disconnected().await {
            warn!("Audio revert after disconnect failed: {}", e);
        }
        info!("Device {} disconnected", link.id);
    }

    async fn handle_link_lost(&self, id: &str, epoch: u64) {
        let link = self.with_link(|slot| {
            let current = slot
                .as_ref()
                .is_some_and(|link| link.id == id && link.epoch == epoch);
            if current { slot.take() } else { None }
        });
        let Some(link) = link else {
            return;
        };

        warn!("Lost connection to {}", id);
        link.cancel.cancel();
        let _ = self.inner.backend.disconnect(id).await;
        let name = self
            .inner
            .store
            .connected_device()
            .map(|device| device.name)
            .unwrap_or_else(|| id.to_string());
        self.inner.store.set_connected_device(None);
        self.inner.store.set_connection_error(format!("Connection to {} lost", name));
        if let Err(e) = self.inner.bridge.on_disconnected().await {
            warn!("Audio revert after link loss failed: {}", e);
        }
    }

    pub fn get_connected_device(&self) -> Option<AudioAccessory> {
        self.inner.store.connected_device()
    }

    pub async fn is_device_connected(&self, id: &str) -> bool {
        let published = self
            .inner
            .store
            .connected_device()
            .is_some_and(|device| device.id == id);
        published && self.inner.backend.is_connected(id).await
    }

    /// Decodes a hex frame offline with the named vendor decoder.
    pub fn test_button_mapping(&self, vendor: Vendor, hex_frame: &str) -> Result<Option<ButtonEvent>, AccessoryError> {
        protocol::test_button_mapping(vendor, hex_frame)
    }

    /// Replaces the preferred device in the store and in persistent storage.
    pub async fn set_preferred_device(&self, device: Option<PreferredDevice>) -> Result<(), AccessoryError> {
        let _write = self.inner.preference_writes.lock().await;
        self.inner.store.set_preferred_device(device.clone());
        save_preferred_device(self.inner.preferences.as_ref(), device.as_ref())
            .await
            .map_err(|e| AccessoryError::Preferences(e.to_string()))
    }

    pub fn preferred_device(&self) -> Option<PreferredDevice> {
        self.inner.store.preferred_device()
    }

    /// Stops background work, the scan and the link. The manager is not
    /// meant to be initialized again afterwards.
    pub async fn destroy(&self) {
        info!("Shutting down accessory manager");
        self.inner.lifetime.cancel();
        let _ = self.stop_scanning().await;
        let _ = self.disconnect_device().await;
    }
}
