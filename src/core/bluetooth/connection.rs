//! Bluetooth connection handling for PTT accessories
//! This module handles connecting with retries and arming the button
//! notification subscriptions on a freshly connected device.

use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{info, warn};
use tokio::sync::mpsc;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::protocol::Vendor;
use crate::core::bluetooth::types::{GattEndpoint, GattSession, Notification};
use crate::core::rt;

/// Connection manager for accessories
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    max_retries: u32,
    retry_delay: u64,
}

impl ConnectionManager {
    pub fn new(max_retries: u32, retry_delay: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// Connect to the device with retry mechanism
    pub async fn connect_with_retry<B: BleBackend>(&self, backend: &B, id: &str) -> Result<GattSession> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            match backend.connect(id).await {
                Ok(session) => {
                    info!("Successfully connected to device {}", id);
                    return Ok(session);
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e);

                    if attempt < self.max_retries {
                        info!("Retrying connection in {} ms...", self.retry_delay);
                        rt::sleep(Duration::from_millis(self.retry_delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Failed to connect after {} attempts", self.max_retries)))
    }

    /// Subscribes to every button characteristic the device exposes.
    ///
    /// Returns the armed endpoints with their decoder. A device exposing none
    /// still counts as connected; it just produces no button events.
    pub async fn arm_button_subscriptions<B: BleBackend>(
        &self,
        backend: &B,
        id: &str,
        endpoints: &[GattEndpoint],
        sink: &mpsc::UnboundedSender<Notification>,
    ) -> Result<Vec<(GattEndpoint, Vendor)>> {
        let buttons = button_endpoints(endpoints);
        if buttons.is_empty() {
            warn!("Device {} exposes no known button characteristic", id);
            return Ok(buttons);
        }

        for (endpoint, vendor) in &buttons {
            info!(
                "Found {} button characteristic: {}",
                vendor, endpoint.characteristic
            );
            backend.subscribe(id, *endpoint, sink.clone()).await?;
        }
        Ok(buttons)
    }

    /// Disconnect from the device. Already-disconnected is fine.
    pub async fn disconnect<B: BleBackend>(&self, backend: &B, id: &str) -> Result<()> {
        if backend.is_connected(id).await {
            info!("Disconnecting from device {}", id);
        } else {
            info!("Device {} not connected, releasing its resources", id);
        }
        backend.disconnect(id).await
    }
}

/// Notifying characteristics a decoder is registered for. Exact vendor pairs
/// sort ahead of generic matches.
pub fn button_endpoints(endpoints: &[GattEndpoint]) -> Vec<(GattEndpoint, Vendor)> {
    let mut buttons: Vec<_> = endpoints
        .iter()
        .filter(|endpoint| endpoint.notifies)
        .filter_map(|endpoint| {
            Vendor::for_endpoint(endpoint.service, endpoint.characteristic)
                .map(|vendor| (*endpoint, vendor))
        })
        .collect();
    buttons.sort_by_key(|(_, vendor)| *vendor == Vendor::Generic);
    buttons
}
