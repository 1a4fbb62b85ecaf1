//! Connection state store
//! The single shared, observable aggregate for adapter state, scan results,
//! the connected accessory, button history and audio routing selection.
//! Every write goes through a setter here; observers subscribe to a
//! `watch` channel and see each committed state.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::core::bluetooth::constants::BUTTON_HISTORY_LIMIT;
use crate::core::bluetooth::types::{
    AdapterState, AudioAccessory, AudioDevice, AudioDeviceKind, ButtonEvent, PreferredDevice,
    VolumeAction,
};

/// Snapshot of everything the subsystem knows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub adapter_state: AdapterState,
    pub permissions_granted: bool,
    pub is_scanning: bool,
    pub is_connecting: bool,
    pub available_devices: Vec<AudioAccessory>,
    pub connected_device: Option<AudioAccessory>,
    /// Current error slot, not a log
    pub connection_error: Option<String>,
    /// Most recent last
    pub button_events: VecDeque<ButtonEvent>,
    pub preferred_device: Option<PreferredDevice>,
    pub audio_devices: Vec<AudioDevice>,
    pub selected_microphone: Option<AudioDevice>,
    pub selected_speaker: Option<AudioDevice>,
    pub routing_active: bool,
    pub microphone_enabled: bool,
    pub last_volume_action: Option<VolumeAction>,
}

/// Cloneable handle to the shared state
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(ConnectionState::default())),
        }
    }

    /// Receives every committed state from now on.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.state.borrow().adapter_state
    }

    pub fn permissions_granted(&self) -> bool {
        self.state.borrow().permissions_granted
    }

    pub fn is_scanning(&self) -> bool {
        self.state.borrow().is_scanning
    }

    pub fn is_connecting(&self) -> bool {
        self.state.borrow().is_connecting
    }

    pub fn available_devices(&self) -> Vec<AudioAccessory> {
        self.state.borrow().available_devices.clone()
    }

    pub fn device(&self, id: &str) -> Option<AudioAccessory> {
        self.state
            .borrow()
            .available_devices
            .iter()
            .find(|device| device.id == id)
            .cloned()
    }

    pub fn connected_device(&self) -> Option<AudioAccessory> {
        self.state.borrow().connected_device.clone()
    }

    pub fn connection_error(&self) -> Option<String> {
        self.state.borrow().connection_error.clone()
    }

    pub fn button_events(&self) -> Vec<ButtonEvent> {
        self.state.borrow().button_events.iter().cloned().collect()
    }

    pub fn preferred_device(&self) -> Option<PreferredDevice> {
        self.state.borrow().preferred_device.clone()
    }

    pub fn microphone_enabled(&self) -> bool {
        self.state.borrow().microphone_enabled
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        self.replace(|state| &mut state.adapter_state, adapter_state);
    }

    pub fn set_permissions_granted(&self, granted: bool) {
        self.replace(|state| &mut state.permissions_granted, granted);
    }

    pub fn set_scanning(&self, scanning: bool) {
        self.replace(|state| &mut state.is_scanning, scanning);
    }

    pub fn set_connecting(&self, connecting: bool) {
        self.replace(|state| &mut state.is_connecting, connecting);
    }

    /// Upserts by identifier, keeping the connected flag consistent.
    pub fn add_device(&self, mut device: AudioAccessory) {
        self.state.send_modify(|state| {
            device.is_connected = state
                .connected_device
                .as_ref()
                .is_some_and(|connected| connected.id == device.id);
            match state.available_devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => *existing = device,
                None => state.available_devices.push(device),
            }
        });
    }

    pub fn clear_devices(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.available_devices.is_empty();
            state.available_devices.clear();
            changed
        });
    }

    /// Sets the single connected device and re-marks every discovered entry.
    pub fn set_connected_device(&self, device: Option<AudioAccessory>) {
        self.state.send_modify(|state| {
            let connected = device.map(|mut device| {
                device.is_connected = true;
                device
            });
            let connected_id = connected.as_ref().map(|device| device.id.clone());
            for entry in state.available_devices.iter_mut() {
                entry.is_connected = connected_id.as_deref() == Some(entry.id.as_str());
            }
            state.connected_device = connected;
        });
    }

    pub fn set_connection_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.state.send_modify(|state| state.connection_error = Some(error));
    }

    pub fn clear_connection_error(&self) {
        self.replace(|state| &mut state.connection_error, None);
    }

    /// Appends to the history, evicting the oldest entries past the cap.
    pub fn push_button_event(&self, event: ButtonEvent) {
        self.state.send_modify(|state| {
            state.button_events.push_back(event);
            while state.button_events.len() > BUTTON_HISTORY_LIMIT {
                state.button_events.pop_front();
            }
        });
    }

    /// Replaces the preferred device outright.
    pub fn set_preferred_device(&self, device: Option<PreferredDevice>) {
        self.replace(|state| &mut state.preferred_device, device);
    }

    /// Upserts an audio endpoint by identifier.
    pub fn add_audio_device(&self, device: AudioDevice) {
        self.state.send_modify(|state| {
            match state.audio_devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => *existing = device,
                None => state.audio_devices.push(device),
            }
        });
    }

    /// Drops every endpoint of `kind`, clearing selections that pointed at one.
    pub fn remove_audio_devices_of_kind(&self, kind: AudioDeviceKind) {
        self.state.send_modify(|state| {
            state.audio_devices.retain(|device| device.kind != kind);
            if state.selected_microphone.as_ref().is_some_and(|d| d.kind == kind) {
                state.selected_microphone = None;
            }
            if state.selected_speaker.as_ref().is_some_and(|d| d.kind == kind) {
                state.selected_speaker = None;
            }
        });
    }

    pub fn select_microphone(&self, device: Option<AudioDevice>) {
        self.replace(|state| &mut state.selected_microphone, device);
    }

    pub fn select_speaker(&self, device: Option<AudioDevice>) {
        self.replace(|state| &mut state.selected_speaker, device);
    }

    pub fn set_routing_active(&self, active: bool) {
        self.replace(|state| &mut state.routing_active, active);
    }

    pub fn set_microphone_enabled(&self, enabled: bool) {
        self.replace(|state| &mut state.microphone_enabled, enabled);
    }

    pub fn record_volume_action(&self, action: VolumeAction) {
        self.state.send_modify(|state| state.last_volume_action = Some(action));
    }

    /// Replaces one field, notifying only if the value changed.
    fn replace<T, F>(&self, field: F, value: T)
    where
        T: PartialEq,
        F: FnOnce(&mut ConnectionState) -> &mut T,
    {
        self.state.send_if_modified(|state| {
            let slot = field(state);
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        });
    }
}
