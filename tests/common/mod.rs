//! Scriptable in-memory Bluetooth stack shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use ptt_headset_bridge::config::BluetoothConfig;
use ptt_headset_bridge::core::bluetooth::constants::{UUID_KLEIN_BUTTON_CHAR, UUID_KLEIN_SERVICE};
use ptt_headset_bridge::core::bluetooth::store::{ConnectionState, ConnectionStore};
use ptt_headset_bridge::core::bluetooth::types::{
    AdapterState, DiscoveredDevice, GattEndpoint, GattSession, LinkEvent, Notification, ScanMode,
};
use ptt_headset_bridge::core::bluetooth::{AccessoryManager, BleBackend};
use ptt_headset_bridge::core::preferences::{MemoryPreferenceStore, PreferenceStore};
use ptt_headset_bridge::core::routing::AudioRoutingBridge;

pub const KLEIN_BUTTON: GattEndpoint = GattEndpoint {
    service: UUID_KLEIN_SERVICE,
    characteristic: UUID_KLEIN_BUTTON_CHAR,
    notifies: true,
};

#[derive(Default)]
pub struct FakeState {
    pub permissions: bool,
    pub adapter: AdapterState,
    adapter_events: Option<mpsc::UnboundedSender<AdapterState>>,
    pub discoveries: Vec<DiscoveredDevice>,
    scan: Option<mpsc::UnboundedSender<DiscoveredDevice>>,
    pub scan_modes: Vec<ScanMode>,
    /// The platform refuses to start scanning.
    pub scan_failure: bool,
    pub stop_scan_calls: usize,
    /// Failures to return before connects start succeeding.
    pub connect_failures: u32,
    pub connect_delay: Option<Duration>,
    pub connect_calls: usize,
    pub endpoints: Vec<GattEndpoint>,
    /// The platform rejects notification subscriptions.
    pub subscribe_failure: bool,
    links: HashMap<String, mpsc::UnboundedSender<LinkEvent>>,
    sinks: HashMap<String, Vec<(GattEndpoint, mpsc::UnboundedSender<Notification>)>>,
    pub connected: HashSet<String>,
    pub disconnect_calls: Vec<String>,
}

/// Cheap to clone; every clone drives the same fake stack.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    /// Powered on, permission granted, one Klein button characteristic.
    pub fn new() -> Self {
        let state = FakeState {
            permissions: true,
            adapter: AdapterState::PoweredOn,
            endpoints: vec![KLEIN_BUTTON],
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn advertise(&self, device: DiscoveredDevice) {
        let mut state = self.state();
        if let Some(scan) = &state.scan {
            let _ = scan.send(device.clone());
        }
        state.discoveries.push(device);
    }

    /// Simulates the host adapter changing state.
    pub fn switch_adapter(&self, adapter: AdapterState) {
        let mut state = self.state();
        state.adapter = adapter;
        if let Some(events) = &state.adapter_events {
            let _ = events.send(adapter);
        }
    }

    /// Pushes a frame on the device's first subscribed characteristic.
    pub fn push_frame(&self, id: &str, value: &[u8]) -> bool {
        let state = self.state();
        let Some((endpoint, sink)) = state.sinks.get(id).and_then(|sinks| sinks.first()) else {
            return false;
        };
        sink.send(Notification {
            service: endpoint.service,
            characteristic: endpoint.characteristic,
            value: value.to_vec(),
        })
        .is_ok()
    }

    /// Simulates the device going out of range.
    pub fn drop_link(&self, id: &str) {
        let mut state = self.state();
        state.connected.remove(id);
        state.sinks.remove(id);
        if let Some(link) = state.links.remove(id) {
            let _ = link.send(LinkEvent::Disconnected);
        }
    }

    pub fn subscriptions(&self, id: &str) -> usize {
        self.state().sinks.get(id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl BleBackend for FakeBackend {
    async fn request_permissions(&self) -> Result<bool> {
        Ok(self.state().permissions)
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.state().adapter)
    }

    async fn adapter_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterState>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().adapter_events = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self, mode: ScanMode) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>> {
        let mut state = self.state();
        if state.scan_failure {
            bail!("Scan start rejected");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for device in &state.discoveries {
            let _ = tx.send(device.clone());
        }
        state.scan_modes.push(mode);
        state.scan = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.state();
        state.stop_scan_calls += 1;
        state.scan = None;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<GattSession> {
        let delay = {
            let mut state = self.state();
            state.connect_calls += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            bail!("GATT error 133");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.links.insert(id.to_string(), tx);
        state.connected.insert(id.to_string());
        Ok(GattSession {
            endpoints: state.endpoints.clone(),
            link_events: rx,
        })
    }

    async fn subscribe(
        &self,
        id: &str,
        endpoint: GattEndpoint,
        sink: mpsc::UnboundedSender<Notification>,
    ) -> Result<()> {
        let mut state = self.state();
        if !state.connected.contains(id) {
            return Err(anyhow!("{} is not connected", id));
        }
        if state.subscribe_failure {
            bail!("CCCD write failed");
        }
        state.sinks.entry(id.to_string()).or_default().push((endpoint, sink));
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.disconnect_calls.push(id.to_string());
        state.connected.remove(id);
        state.sinks.remove(id);
        state.links.remove(id);
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> bool {
        self.state().connected.contains(id)
    }
}

pub struct Harness {
    pub backend: FakeBackend,
    pub store: ConnectionStore,
    pub bridge: AudioRoutingBridge,
    pub preferences: Arc<MemoryPreferenceStore>,
    pub manager: AccessoryManager<FakeBackend>,
}

pub fn test_config() -> BluetoothConfig {
    BluetoothConfig {
        scan_duration_ms: 10_000,
        min_rssi: -60,
        auto_connect_preferred: true,
        connect_retries: 3,
        connect_retry_delay_ms: 1000,
    }
}

pub fn harness(backend: FakeBackend) -> Harness {
    harness_with(backend, test_config(), Arc::new(MemoryPreferenceStore::new()))
}

pub fn harness_with(
    backend: FakeBackend,
    config: BluetoothConfig,
    preferences: Arc<MemoryPreferenceStore>,
) -> Harness {
    let store = ConnectionStore::new();
    let bridge = AudioRoutingBridge::new(store.clone());
    let manager = AccessoryManager::new(
        backend.clone(),
        store.clone(),
        bridge.clone(),
        preferences.clone() as Arc<dyn PreferenceStore>,
        config,
    );
    Harness {
        backend,
        store,
        bridge,
        preferences,
        manager,
    }
}

/// A device that passes the classifier on its name.
pub fn headset(id: &str, rssi: i16) -> DiscoveredDevice {
    DiscoveredDevice::new(id, Some("Klein PTT Headset".to_string()), Some(rssi))
}

/// Waits until `condition` holds on the store, failing after five
/// (possibly virtual) seconds.
pub async fn wait_until(store: &ConnectionStore, condition: impl FnMut(&ConnectionState) -> bool) {
    let mut updates = store.subscribe();
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(condition))
        .await
        .expect("store condition not reached in time")
        .expect("store dropped");
}
