//! Core functionality for the PTT headset bridge
//! Bluetooth accessory handling, audio routing and preference storage.

pub mod bluetooth;
pub mod preferences;
pub mod routing;
pub mod rt;

// Re-export commonly used types
pub use bluetooth::{AccessoryManager, ConnectionStore};
pub use routing::{AudioFeedback, AudioRoutingBridge, VoiceSession};
