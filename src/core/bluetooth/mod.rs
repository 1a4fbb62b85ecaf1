//! Bluetooth functionality for the PTT headset bridge
//! This module handles discovery, classification, connection management
//! and button decoding for push-to-talk audio accessories.

pub mod backend;
pub mod classifier;
pub mod connection;
pub mod constants;
pub mod manager;
pub mod notification;
pub mod protocol;
pub mod scanner;
pub mod store;
pub mod types;

// Re-export types that should be publicly accessible
pub use backend::{BleBackend, PlatformBackend, create_platform_backend};
pub use connection::ConnectionManager;
pub use manager::AccessoryManager;
pub use notification::NotificationHandler;
pub use protocol::Vendor;
pub use scanner::BluetoothScanner;
pub use store::{ConnectionState, ConnectionStore};
pub use types::{
    AdapterState, AudioAccessory, AudioDevice, AudioDeviceKind, Button, ButtonEvent,
    DiscoveredDevice, PreferredDevice, PressType, ScanMode,
};
