//! Desktop binding on top of bluest
//! Wraps the OS Bluetooth stack (BlueZ, CoreBluetooth, WinRT) for
//! discovery, GATT connection and characteristic notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, AdapterEvent, AdvertisingDevice, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::BleBackend;
use crate::core::bluetooth::types::{
    AdapterState, AdvertisementData, DiscoveredDevice, GattEndpoint, GattSession, LinkEvent,
    ManufacturerData, Notification, ScanMode,
};

/// Per-connection resources: every subscription task listens on `cancel`.
struct Link {
    device: Device,
    characteristics: HashMap<(uuid::Uuid, uuid::Uuid), Characteristic>,
    cancel: CancellationToken,
}

/// bluest-backed BLE binding
pub struct NativeBackend {
    adapter: Adapter,
    /// Devices seen during scanning, by id
    devices: Arc<Mutex<HashMap<String, Device>>>,
    links: Mutex<HashMap<String, Link>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl NativeBackend {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("Bluetooth adapter acquired.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            links: Mutex::new(HashMap::new()),
            scan_cancel: Mutex::new(None),
        })
    }

    /// Finds a device seen in a scan, falling back to already-connected ones.
    async fn find_device(&self, id: &str) -> Result<Device> {
        if let Some(device) = lock(&self.devices)?.get(id).cloned() {
            return Ok(device);
        }
        let connected = self.adapter.connected_devices().await?;
        connected
            .into_iter()
            .find(|device| device.id().to_string() == id)
            .ok_or_else(|| anyhow!("Device not found with ID: {}", id))
    }

    fn to_discovered(advertising: &AdvertisingDevice) -> DiscoveredDevice {
        let adv = &advertising.adv_data;
        let name = adv
            .local_name
            .clone()
            .or_else(|| advertising.device.name().ok());
        let advertisement = AdvertisementData {
            services: adv.services.iter().copied().collect(),
            manufacturer_data: adv.manufacturer_data.as_ref().map(|m| ManufacturerData {
                company_id: m.company_id,
                data: m.data.to_vec(),
            }),
            service_data: adv
                .service_data
                .iter()
                .map(|(uuid, data)| (*uuid, data.to_vec()))
                .collect(),
        };
        DiscoveredDevice::new(advertising.device.id().to_string(), name, advertising.rssi)
            .with_advertisement(advertisement)
    }

    async fn discover_endpoints(
        device: &Device,
    ) -> Result<(Vec<GattEndpoint>, HashMap<(uuid::Uuid, uuid::Uuid), Characteristic>)> {
        let mut endpoints = Vec::new();
        let mut characteristics = HashMap::new();

        for service in device.services().await? {
            let service_uuid = service.uuid();
            for characteristic in service.characteristics().await? {
                let char_uuid = characteristic.uuid();
                let notifies = match characteristic.properties().await {
                    Ok(props) => props.notify || props.indicate,
                    Err(e) => {
                        warn!("Could not read properties of {}: {}", char_uuid, e);
                        false
                    }
                };
                debug!(
                    "Service {} characteristic {} (notify: {})",
                    service_uuid, char_uuid, notifies
                );
                endpoints.push(GattEndpoint {
                    service: service_uuid,
                    characteristic: char_uuid,
                    notifies,
                });
                characteristics.insert((service_uuid, char_uuid), characteristic);
            }
        }
        Ok((endpoints, characteristics))
    }

    /// Forwards notifications until the stream ends or the link is torn down.
    /// `ready` reports whether the subscription itself was accepted.
    async fn process_notifications(
        characteristic: Characteristic,
        service: uuid::Uuid,
        sink: mpsc::UnboundedSender<Notification>,
        cancel: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let char_uuid = characteristic.uuid();
        let mut stream = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to {}: {}", char_uuid, e);
                let _ = ready.send(Err(e.into()));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        info!("Listening for notifications on {}", char_uuid);

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        let notification = Notification {
                            service,
                            characteristic: char_uuid,
                            value,
                        };
                        if sink.send(notification).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        info!("Notification stream for {} ended", char_uuid);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("Bluetooth backend lock poisoned"))
}

#[async_trait]
impl BleBackend for NativeBackend {
    async fn request_permissions(&self) -> Result<bool> {
        // Desktop stacks grant access at the OS level; a missing grant shows
        // up as an unavailable adapter instead.
        Ok(true)
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        match self.adapter.is_available().await {
            Ok(true) => Ok(AdapterState::PoweredOn),
            Ok(false) => Ok(AdapterState::PoweredOff),
            Err(e) => match e.kind() {
                ErrorKind::NotAuthorized => Ok(AdapterState::Unauthorized),
                ErrorKind::NotSupported => Ok(AdapterState::Unsupported),
                ErrorKind::NotReady => Ok(AdapterState::Resetting),
                _ => Err(e.into()),
            },
        }
    }

    async fn adapter_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterState>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to watch adapter events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                let state = match event {
                    Ok(AdapterEvent::Available) => AdapterState::PoweredOn,
                    Ok(AdapterEvent::Unavailable) => AdapterState::PoweredOff,
                    Err(e) => {
                        error!("Adapter event stream error: {}", e);
                        continue;
                    }
                };
                if tx.send(state).is_err() {
                    break;
                }
            }
            info!("Adapter event stream ended");
        });
        Ok(rx)
    }

    async fn start_scan(&self, mode: ScanMode) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>> {
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_cancel)?.replace(cancel.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();

        tokio::spawn(async move {
            info!("Starting bluetooth scan ({:?})", mode);
            let mut scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            loop {
                tokio::select! {
                    result = scan_stream.next() => match result {
                        Some(advertising) => {
                            let discovered = Self::to_discovered(&advertising);
                            debug!(
                                "Found device - ID: {}, Name: {:?}, RSSI: {:?}",
                                discovered.id, discovered.name, discovered.rssi
                            );
                            if let Ok(mut devices) = devices.lock() {
                                devices.insert(discovered.id.clone(), advertising.device.clone());
                            }
                            if tx.send(discovered).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| anyhow!("Scan task ended before starting"))??;
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(cancel) = lock(&self.scan_cancel)?.take() {
            info!("Stopping Bluetooth scan.");
            cancel.cancel();
        }
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<GattSession> {
        let device = self.find_device(id).await?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Device details - ID: {}, Name: {:?}", id, name);

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter.connect_device(&device).await?;
        }

        info!("Connection successful, discovering services...");
        let (endpoints, characteristics) = match Self::discover_endpoints(&device).await {
            Ok(found) => found,
            Err(e) => {
                let _ = self.adapter.disconnect_device(&device).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        {
            let adapter = self.adapter.clone();
            let device = device.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut events = match adapter.device_connection_events(&device).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Connection events unavailable for {}: {}", device.id(), e);
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        event = events.next() => match event {
                            Some(ConnectionEvent::Disconnected) => {
                                info!("Device {} dropped the link", device.id());
                                let _ = link_tx.send(LinkEvent::Disconnected);
                                break;
                            }
                            Some(_) => {}
                            None => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        let previous = lock(&self.links)?.insert(
            id.to_string(),
            Link {
                device,
                characteristics,
                cancel,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!("Discovered {} characteristics on {}", endpoints.len(), id);
        Ok(GattSession {
            endpoints,
            link_events: link_rx,
        })
    }

    async fn subscribe(
        &self,
        id: &str,
        endpoint: GattEndpoint,
        sink: mpsc::UnboundedSender<Notification>,
    ) -> Result<()> {
        let (characteristic, cancel) = {
            let links = lock(&self.links)?;
            let link = links
                .get(id)
                .ok_or_else(|| anyhow!("Device {} is not connected", id))?;
            let characteristic = link
                .characteristics
                .get(&(endpoint.service, endpoint.characteristic))
                .cloned()
                .ok_or_else(|| {
                    anyhow!("Characteristic not found: {}", endpoint.characteristic)
                })?;
            (characteristic, link.cancel.clone())
        };

        info!("Subscribing to notifications on {}...", endpoint.characteristic);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::process_notifications(
            characteristic,
            endpoint.service,
            sink,
            cancel,
            ready_tx,
        ));
        ready_rx
            .await
            .map_err(|_| anyhow!("Subscription task for {} ended early", endpoint.characteristic))?
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let link = lock(&self.links)?.remove(id);
        let Some(link) = link else {
            info!("Device {} not connected", id);
            return Ok(());
        };

        link.cancel.cancel();
        if link.device.is_connected().await {
            info!("Disconnecting from device {}", id);
            self.adapter.disconnect_device(&link.device).await?;
            info!("Successfully disconnected");
        }
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> bool {
        let device = match lock(&self.links) {
            Ok(links) => links.get(id).map(|link| link.device.clone()),
            Err(_) => None,
        };
        match device {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }
}
