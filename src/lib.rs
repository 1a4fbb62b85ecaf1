//! PTT headset bridge library
//! Discovers push-to-talk Bluetooth headsets, decodes their buttons and
//! routes them to the microphone of a live voice call.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;

#[cfg(not(target_arch = "wasm32"))]
pub mod commands;
#[cfg(not(target_arch = "wasm32"))]
pub mod utils;

pub use error::AccessoryError;
