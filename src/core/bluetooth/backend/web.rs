//! Browser binding on top of Web Bluetooth
//! The browser exposes no passive scanning; discovery is a single
//! user-driven chooser whose filters do the audio classification.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use js_sys::{Array, Object, Promise, Reflect, Uint8Array};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use super::BleBackend;
use crate::core::bluetooth::constants::AUDIO_SERVICE_UUIDS;
use crate::core::bluetooth::types::{
    AdapterState, DiscoveredDevice, DiscoveryOrigin, GattEndpoint, GattSession, LinkEvent,
    Notification, ScanMode,
};
use crate::core::rt;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(extends = web_sys::EventTarget)]
    #[derive(Clone)]
    type Bluetooth;

    #[wasm_bindgen(method, js_name = requestDevice)]
    fn request_device(this: &Bluetooth, options: &JsValue) -> Promise;

    #[wasm_bindgen(method, js_name = getAvailability)]
    fn get_availability(this: &Bluetooth) -> Promise;

    #[wasm_bindgen(extends = web_sys::EventTarget)]
    #[derive(Clone)]
    type BluetoothDevice;

    #[wasm_bindgen(method, getter)]
    fn id(this: &BluetoothDevice) -> String;

    #[wasm_bindgen(method, getter)]
    fn name(this: &BluetoothDevice) -> Option<String>;

    #[wasm_bindgen(method, getter)]
    fn gatt(this: &BluetoothDevice) -> Option<BluetoothRemoteGattServer>;

    type BluetoothRemoteGattServer;

    #[wasm_bindgen(method, getter)]
    fn connected(this: &BluetoothRemoteGattServer) -> bool;

    #[wasm_bindgen(method)]
    fn connect(this: &BluetoothRemoteGattServer) -> Promise;

    #[wasm_bindgen(method)]
    fn disconnect(this: &BluetoothRemoteGattServer);

    #[wasm_bindgen(method, js_name = getPrimaryServices)]
    fn get_primary_services(this: &BluetoothRemoteGattServer) -> Promise;

    type BluetoothRemoteGattService;

    #[wasm_bindgen(method, getter)]
    fn uuid(this: &BluetoothRemoteGattService) -> String;

    #[wasm_bindgen(method, js_name = getCharacteristics)]
    fn get_characteristics(this: &BluetoothRemoteGattService) -> Promise;

    #[wasm_bindgen(extends = web_sys::EventTarget)]
    #[derive(Clone)]
    type BluetoothRemoteGattCharacteristic;

    #[wasm_bindgen(method, getter, js_name = uuid)]
    fn char_uuid(this: &BluetoothRemoteGattCharacteristic) -> String;

    #[wasm_bindgen(method, getter)]
    fn properties(this: &BluetoothRemoteGattCharacteristic) -> CharacteristicProperties;

    #[wasm_bindgen(method, getter)]
    fn value(this: &BluetoothRemoteGattCharacteristic) -> Option<js_sys::DataView>;

    #[wasm_bindgen(method, js_name = startNotifications)]
    fn start_notifications(this: &BluetoothRemoteGattCharacteristic) -> Promise;

    type CharacteristicProperties;

    #[wasm_bindgen(method, getter)]
    fn notify(this: &CharacteristicProperties) -> bool;

    #[wasm_bindgen(method, getter)]
    fn indicate(this: &CharacteristicProperties) -> bool;
}

type Listener = Closure<dyn FnMut(web_sys::Event)>;

/// An installed event listener, removed again when dropped.
struct Registration {
    target: web_sys::EventTarget,
    event: &'static str,
    listener: Listener,
}

impl Registration {
    fn install(target: &web_sys::EventTarget, event: &'static str, listener: Listener) -> Result<Self> {
        target
            .add_event_listener_with_callback(event, listener.as_ref().unchecked_ref())
            .map_err(js_error)?;
        Ok(Self {
            target: target.clone(),
            event,
            listener,
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = self
            .target
            .remove_event_listener_with_callback(self.event, self.listener.as_ref().unchecked_ref());
    }
}

struct Link {
    characteristics: HashMap<(Uuid, Uuid), BluetoothRemoteGattCharacteristic>,
    registrations: Vec<Registration>,
}

/// Web Bluetooth binding
pub struct WebBackend {
    bluetooth: Option<Bluetooth>,
    /// Devices handed back by the chooser, by id
    devices: Rc<RefCell<HashMap<String, BluetoothDevice>>>,
    links: RefCell<HashMap<String, Link>>,
    adapter_listener: RefCell<Option<Registration>>,
}

impl WebBackend {
    pub async fn new() -> Result<Self> {
        let bluetooth = web_sys::window()
            .map(|window| window.navigator())
            .and_then(|navigator| Reflect::get(&navigator, &JsValue::from_str("bluetooth")).ok())
            .filter(|value| !value.is_undefined() && !value.is_null())
            .map(|value| value.unchecked_into::<Bluetooth>());
        if bluetooth.is_none() {
            warn!("Web Bluetooth is not available in this browser");
        }
        Ok(Self {
            bluetooth,
            devices: Rc::new(RefCell::new(HashMap::new())),
            links: RefCell::new(HashMap::new()),
            adapter_listener: RefCell::new(None),
        })
    }

    fn bluetooth(&self) -> Result<&Bluetooth> {
        self.bluetooth
            .as_ref()
            .ok_or_else(|| anyhow!("Web Bluetooth is not supported"))
    }

    /// Chooser options: audio service filters for normal scans, accept-all
    /// for debug scans. Audio and vendor services are always requested as
    /// optional so they can be read after connecting.
    fn request_options(mode: ScanMode) -> Result<Object> {
        let options = Object::new();
        match mode {
            ScanMode::Normal => {
                let filters = Array::new();
                for uuid in AUDIO_SERVICE_UUIDS {
                    let filter = Object::new();
                    let services = Array::of1(&JsValue::from_str(&uuid.to_string()));
                    set(&filter, "services", &services)?;
                    filters.push(&filter);
                }
                for prefix in ["AINA", "Klein", "Pryme", "PTT"] {
                    let filter = Object::new();
                    set(&filter, "namePrefix", &JsValue::from_str(prefix))?;
                    filters.push(&filter);
                }
                set(&options, "filters", &filters)?;
            }
            ScanMode::Debug => set(&options, "acceptAllDevices", &JsValue::TRUE)?,
        }

        let optional = Array::new();
        for uuid in AUDIO_SERVICE_UUIDS {
            optional.push(&JsValue::from_str(&uuid.to_string()));
        }
        set(&options, "optionalServices", &optional)?;
        Ok(options)
    }

    fn device(&self, id: &str) -> Result<BluetoothDevice> {
        self.devices
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("Device not found with ID: {}", id))
    }
}

fn set(target: &Object, key: &str, value: &JsValue) -> Result<()> {
    Reflect::set(target, &JsValue::from_str(key), value)
        .map(|_| ())
        .map_err(js_error)
}

fn js_error(value: JsValue) -> anyhow::Error {
    let message = value
        .as_string()
        .or_else(|| {
            Reflect::get(&value, &JsValue::from_str("message"))
                .ok()
                .and_then(|m| m.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", value));
    anyhow!(message)
}

async fn await_promise(promise: Promise) -> Result<JsValue> {
    JsFuture::from(promise).await.map_err(js_error)
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| anyhow!("Invalid UUID {}: {}", value, e))
}

#[async_trait(?Send)]
impl BleBackend for WebBackend {
    async fn request_permissions(&self) -> Result<bool> {
        // Access is granted per device through the chooser.
        Ok(self.bluetooth.is_some())
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        let Ok(bluetooth) = self.bluetooth() else {
            return Ok(AdapterState::Unsupported);
        };
        let available = await_promise(bluetooth.get_availability()).await?;
        Ok(if available.as_bool().unwrap_or(false) {
            AdapterState::PoweredOn
        } else {
            AdapterState::PoweredOff
        })
    }

    async fn adapter_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterState>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(bluetooth) = self.bluetooth() else {
            return Ok(rx);
        };

        let listener = Closure::<dyn FnMut(web_sys::Event)>::new(move |event: web_sys::Event| {
            let available = Reflect::get(&event, &JsValue::from_str("value"))
                .ok()
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            let state = if available {
                AdapterState::PoweredOn
            } else {
                AdapterState::PoweredOff
            };
            let _ = tx.send(state);
        });
        let registration = Registration::install(bluetooth, "availabilitychanged", listener)?;
        self.adapter_listener.replace(Some(registration));
        Ok(rx)
    }

    async fn start_scan(&self, mode: ScanMode) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>> {
        let bluetooth = self.bluetooth()?.clone();
        let options = Self::request_options(mode)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let devices = self.devices.clone();

        info!("Opening Web Bluetooth chooser ({:?})", mode);
        rt::spawn(async move {
            match await_promise(bluetooth.request_device(&options)).await {
                Ok(value) => {
                    let device: BluetoothDevice = value.unchecked_into();
                    let id = device.id();
                    let mut discovered = DiscoveredDevice::new(id.clone(), device.name(), None);
                    discovered.origin = DiscoveryOrigin::UserPicker;
                    debug!("Chooser returned {} ({:?})", id, discovered.name);
                    devices.borrow_mut().insert(id, device);
                    let _ = tx.send(discovered);
                }
                Err(e) => info!("Chooser closed without a device: {}", e),
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        // The chooser cannot be closed from script. A late pick still lands in
        // the device map but nobody is listening for it.
        debug!("Web Bluetooth scan stop requested");
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<GattSession> {
        let device = self.device(id)?;
        let gatt = device
            .gatt()
            .ok_or_else(|| anyhow!("Device {} has no GATT server", id))?;

        info!("Initiating connection to {}...", id);
        let server: BluetoothRemoteGattServer = await_promise(gatt.connect()).await?.unchecked_into();

        info!("Connection successful, discovering services...");
        let services = match await_promise(server.get_primary_services()).await {
            Ok(services) => Array::from(&services),
            Err(e) => {
                server.disconnect();
                return Err(e);
            }
        };

        let mut endpoints = Vec::new();
        let mut characteristics = HashMap::new();
        for service in services.iter() {
            let service: BluetoothRemoteGattService = service.unchecked_into();
            let service_uuid = parse_uuid(&service.uuid())?;
            let chars = match await_promise(service.get_characteristics()).await {
                Ok(chars) => Array::from(&chars),
                Err(e) => {
                    warn!("No characteristics readable on {}: {}", service_uuid, e);
                    continue;
                }
            };
            for characteristic in chars.iter() {
                let characteristic: BluetoothRemoteGattCharacteristic = characteristic.unchecked_into();
                let char_uuid = parse_uuid(&characteristic.char_uuid())?;
                let props = characteristic.properties();
                let notifies = props.notify() || props.indicate();
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

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let on_disconnect = Closure::<dyn FnMut(web_sys::Event)>::new(move |_event: web_sys::Event| {
            let _ = link_tx.send(LinkEvent::Disconnected);
        });
        let registration = Registration::install(&device, "gattserverdisconnected", on_disconnect)?;

        self.links.borrow_mut().insert(
            id.to_string(),
            Link {
                characteristics,
                registrations: vec![registration],
            },
        );

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
        let characteristic = self
            .links
            .borrow()
            .get(id)
            .ok_or_else(|| anyhow!("Device {} is not connected", id))?
            .characteristics
            .get(&(endpoint.service, endpoint.characteristic))
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic not found: {}", endpoint.characteristic))?;

        let service = endpoint.service;
        let char_uuid = endpoint.characteristic;
        let source = characteristic.clone();
        let listener = Closure::<dyn FnMut(web_sys::Event)>::new(move |_event: web_sys::Event| {
            let Some(view) = source.value() else {
                return;
            };
            let value = Uint8Array::new_with_byte_offset_and_length(
                &view.buffer(),
                view.byte_offset() as u32,
                view.byte_length() as u32,
            )
            .to_vec();
            let _ = sink.send(Notification {
                service,
                characteristic: char_uuid,
                value,
            });
        });
        let registration = Registration::install(&characteristic, "characteristicvaluechanged", listener)?;

        info!("Subscribing to notifications on {}...", char_uuid);
        if let Err(e) = await_promise(characteristic.start_notifications()).await {
            error!("Failed to start notifications on {}: {}", char_uuid, e);
            return Err(e);
        }

        match self.links.borrow_mut().get_mut(id) {
            Some(link) => link.registrations.push(registration),
            None => return Err(anyhow!("Device {} disconnected during subscribe", id)),
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let link = self.links.borrow_mut().remove(id);
        if link.is_none() {
            info!("Device {} not connected", id);
        }
        drop(link);

        if let Some(gatt) = self.devices.borrow().get(id).and_then(|device| device.gatt()) {
            if gatt.connected() {
                info!("Disconnecting from device {}", id);
                gatt.disconnect();
            }
        }
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> bool {
        self.devices
            .borrow()
            .get(id)
            .and_then(|device| device.gatt())
            .is_some_and(|gatt| gatt.connected())
    }
}

impl Drop for WebBackend {
    fn drop(&mut self) {
        for device in self.devices.borrow().values() {
            if let Some(gatt) = device.gatt().filter(|gatt| gatt.connected()) {
                gatt.disconnect();
            }
        }
    }
}
