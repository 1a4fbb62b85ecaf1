//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::protocol::Vendor;

/// Power/authorization state of the host Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Scanning and connecting are only permitted when powered on.
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }

    /// States in which the hardware cannot be trusted to report a clean disconnect.
    pub fn requires_teardown(self) -> bool {
        matches!(self, AdapterState::PoweredOff | AdapterState::Unauthorized)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "powered off",
            AdapterState::PoweredOn => "powered on",
        };
        f.write_str(label)
    }
}

/// Manufacturer-specific advertisement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier (the first two payload bytes, little endian)
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// The parts of an advertisement the classifier looks at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub services: Vec<Uuid>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// How a device reached the binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryOrigin {
    /// Heard in a radio advertisement.
    #[default]
    Advertisement,
    /// Picked by the user in a platform chooser (Web Bluetooth), no RSSI available.
    UserPicker,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform-stable identifier
    pub id: String,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
    pub advertisement: AdvertisementData,
    #[serde(default)]
    pub origin: DiscoveryOrigin,
}

impl DiscoveredDevice {
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
            advertisement: AdvertisementData::default(),
            origin: DiscoveryOrigin::Advertisement,
        }
    }

    pub fn with_advertisement(mut self, advertisement: AdvertisementData) -> Self {
        self.advertisement = advertisement;
        self
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// A discovered device that passed classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioAccessory {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub is_connected: bool,
    pub has_audio_capability: bool,
    pub supports_microphone_control: bool,
    /// The underlying discovery record
    pub device: DiscoveredDevice,
}

/// The one accessory persisted across sessions for auto-connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredDevice {
    pub id: String,
    pub name: String,
}

impl PreferredDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressType {
    Press,
    LongPress,
    DoublePress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    PttStart,
    PttStop,
    VolumeUp,
    VolumeDown,
    Mute,
    Unknown,
}

/// A normalized hardware button event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEvent {
    #[serde(rename = "type")]
    pub press_type: PressType,
    pub button: Button,
    pub timestamp: DateTime<Utc>,
    /// Decoder that produced the event
    pub vendor: Vendor,
    /// The frame as received, kept for protocol reverse-engineering
    pub raw: Vec<u8>,
}

impl ButtonEvent {
    pub fn new(vendor: Vendor, button: Button, press_type: PressType, raw: &[u8]) -> Self {
        Self {
            press_type,
            button,
            timestamp: Utc::now(),
            vendor,
            raw: raw.to_vec(),
        }
    }
}

/// Scan flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// RSSI gate plus classifier.
    Normal,
    /// Accept-all variant for field troubleshooting.
    Debug,
}

/// A notifying GATT characteristic discovered on a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattEndpoint {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub notifies: bool,
}

/// A characteristic value pushed by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Out-of-band events for one GATT link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected,
}

/// Result of a successful platform connect plus service discovery.
#[derive(Debug)]
pub struct GattSession {
    pub endpoints: Vec<GattEndpoint>,
    pub link_events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Transport of a logical audio endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDeviceKind {
    BuiltIn,
    Wired,
    Bluetooth,
}

/// A logical microphone and/or speaker the call layer can route to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub kind: AudioDeviceKind,
    pub is_input: bool,
    pub is_output: bool,
}

impl AudioDevice {
    /// The phone's own earpiece and microphone.
    pub fn built_in() -> Self {
        Self {
            id: "built-in".to_string(),
            name: "Phone".to_string(),
            kind: AudioDeviceKind::BuiltIn,
            is_input: true,
            is_output: true,
        }
    }

    pub fn from_accessory(accessory: &AudioAccessory) -> Self {
        Self {
            id: accessory.id.clone(),
            name: accessory.name.clone(),
            kind: AudioDeviceKind::Bluetooth,
            is_input: accessory.supports_microphone_control,
            is_output: true,
        }
    }
}

/// Volume button presses are recorded, not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeAction {
    Up,
    Down,
}
