//! Command line commands
//! This module defines the commands the `ptt-headset-bridge` binary exposes.

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};

use crate::config::AppConfig;
use crate::core::bluetooth::protocol::{self, Vendor};
use crate::core::bluetooth::{AccessoryManager, BleBackend, ButtonEvent, ConnectionState, PreferredDevice};
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "ptt-headset-bridge", version, about = "Push-to-talk Bluetooth headset bridge")]
pub struct Cli {
    /// Log level, e.g. "debug". RUST_LOG takes precedence.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for PTT audio accessories
    Scan {
        /// Skip the signal gate and the classifier
        #[arg(long)]
        debug: bool,
        /// Scan duration in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Connect to an accessory and print its button events until Ctrl-C
    Connect {
        /// Platform device identifier as printed by `scan`
        id: String,
    },
    /// Decode a hex frame offline, e.g. `decode klein "81 00"`
    Decode {
        /// aina, klein, pryme or generic
        vendor: Vendor,
        hex: String,
    },
    /// Show, set or clear the preferred device
    Preferred {
        #[command(subcommand)]
        action: Option<PreferredAction>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PreferredAction {
    Set { id: String, name: String },
    Clear,
}

pub async fn run(command: Command, config: AppConfig) -> Result<()> {
    if let Command::Decode { vendor, hex } = &command {
        return decode(*vendor, hex);
    }

    let state = AppState::new(config).await?;
    let manager = state.manager();
    manager.initialize().await?;

    let result = match command {
        Command::Scan { debug, duration_ms } => scan(&manager, debug, duration_ms).await,
        Command::Connect { id } => connect(&manager, &id).await,
        Command::Preferred { action } => preferred(&manager, action).await,
        Command::Decode { .. } => Ok(()),
    };
    manager.destroy().await;
    result
}

fn decode(vendor: Vendor, hex: &str) -> Result<()> {
    match protocol::test_button_mapping(vendor, hex)? {
        Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
        None => println!("(empty frame, nothing decoded)"),
    }
    Ok(())
}

async fn ensure_permissions<B: BleBackend>(manager: &AccessoryManager<B>) -> Result<()> {
    if !manager.request_permissions().await? {
        bail!("Bluetooth permission was not granted");
    }
    Ok(())
}

/// Scans for the requested duration and prints what was found.
pub async fn scan<B: BleBackend>(manager: &AccessoryManager<B>, debug: bool, duration_ms: Option<u64>) -> Result<()> {
    ensure_permissions(manager).await?;
    if debug {
        manager.start_debug_scanning(duration_ms).await?;
    } else {
        manager.start_scanning(duration_ms).await?;
    }

    let mut updates = manager.store().subscribe();
    updates.wait_for(|state| !state.is_scanning).await?;

    let devices = manager.store().available_devices();
    if devices.is_empty() {
        println!("No accessories found.");
    }
    for device in devices {
        println!(
            "{:<40} {:<24} rssi {:>4}  audio {:<5}  mic {}",
            device.id,
            device.name,
            device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            device.has_audio_capability,
            device.supports_microphone_control,
        );
    }
    Ok(())
}

/// Connects to `id`, scanning for it first if needed, then prints button events.
pub async fn connect<B: BleBackend>(manager: &AccessoryManager<B>, id: &str) -> Result<()> {
    ensure_permissions(manager).await?;

    if manager.store().device(id).is_none() {
        info!("Looking for {}...", id);
        manager.start_debug_scanning(None).await?;
        let mut updates = manager.store().subscribe();
        updates
            .wait_for(|state| !state.is_scanning || state.available_devices.iter().any(|d| d.id == id))
            .await?;
        manager.stop_scanning().await?;
    }

    let accessory = match manager.connect_to_device(id).await {
        Ok(accessory) => accessory,
        Err(crate::AccessoryError::RoutingFailed(e)) => {
            warn!("Connected, but audio routing failed: {}", e);
            manager
                .get_connected_device()
                .ok_or_else(|| anyhow!("Device {} dropped right after connecting", id))?
        }
        Err(e) => return Err(e.into()),
    };
    println!("Connected to {} ({}). Press Ctrl-C to quit.", accessory.name, accessory.id);

    let mut updates = manager.store().subscribe();
    let mut printed: Option<ButtonEvent> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                changed?;
                let state = updates.borrow_and_update().clone();
                printed = print_new_events(&state, printed)?;
                if state.connected_device.is_none() {
                    let reason = state.connection_error.unwrap_or_else(|| "disconnected".into());
                    println!("{}", reason);
                    return Ok(());
                }
            }
        }
    }

    manager.disconnect_device().await?;
    Ok(())
}

/// Prints history entries newer than `last`, returning the newest one.
fn print_new_events(state: &ConnectionState, last: Option<ButtonEvent>) -> Result<Option<ButtonEvent>> {
    let start = match &last {
        Some(last) => state
            .button_events
            .iter()
            .rposition(|event| event == last)
            .map(|index| index + 1)
            .unwrap_or(0),
        None => 0,
    };
    for event in state.button_events.iter().skip(start) {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(state.button_events.back().cloned().or(last))
}

async fn preferred<B: BleBackend>(manager: &AccessoryManager<B>, action: Option<PreferredAction>) -> Result<()> {
    match action {
        None => match manager.preferred_device() {
            Some(device) => println!("{} ({})", device.name, device.id),
            None => println!("No preferred device."),
        },
        Some(PreferredAction::Set { id, name }) => {
            manager.set_preferred_device(Some(PreferredDevice::new(id, name))).await?;
        }
        Some(PreferredAction::Clear) => manager.set_preferred_device(None).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli() {
        let cli = Cli::parse_from(["ptt-headset-bridge", "scan", "--debug", "--duration-ms", "5000"]);
        assert!(matches!(
            cli.command,
            Command::Scan { debug: true, duration_ms: Some(5000) }
        ));

        let cli = Cli::parse_from(["ptt-headset-bridge", "decode", "klein", "81"]);
        assert!(matches!(cli.command, Command::Decode { vendor: Vendor::Klein, .. }));

        let cli = Cli::parse_from(["ptt-headset-bridge", "preferred", "clear"]);
        assert!(matches!(cli.command, Command::Preferred { action: Some(PreferredAction::Clear) }));
    }

    #[test]
    fn test_unknown_vendor_is_rejected() {
        assert!(Cli::try_parse_from(["ptt-headset-bridge", "decode", "zebra", "00"]).is_err());
    }
}
