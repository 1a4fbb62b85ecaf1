//! Error types for the accessory subsystem.

use thiserror::Error;

use crate::core::bluetooth::types::AdapterState;

/// Errors surfaced by the accessory manager and its platform backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessoryError {
    /// Scan or connect was refused before touching the hardware.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The adapter is off, unauthorized or unsupported.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(AdapterState),

    /// The platform connect or the service discovery step failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Another `connect_to_device` call is still running.
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// A disconnect was requested while this connect attempt was in flight.
    #[error("Connection attempt superseded by a disconnect")]
    Superseded,

    /// An audio-routing side effect failed. The BLE link itself stays up.
    #[error("Audio routing failed: {0}")]
    RoutingFailed(String),

    /// A diagnostic hex frame could not be parsed.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Preference storage error: {0}")]
    Preferences(String),

    /// Any other failure reported by the platform Bluetooth stack.
    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

impl AccessoryError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed(err.to_string())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
