//! Audio accessory classification
//!
//! Pure checks deciding whether a discovered radio is plausibly a PTT
//! headset or speaker. Four independent signals are OR'd together: name
//! keywords, advertised service identifiers, manufacturer data and service
//! data.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    AUDIO_CHIPSET_COMPANY_IDS, AUDIO_NAME_KEYWORDS, AUDIO_PAYLOAD_KEYWORDS, AUDIO_SERVICE_UUIDS,
    COD_AUDIO_MINOR_CLASSES, COD_MAJOR_AUDIO_VIDEO, MICROPHONE_CONTROL_UUIDS, VENDOR_NAME_FRAGMENTS,
};
use crate::core::bluetooth::types::{
    AudioAccessory, DiscoveredDevice, DiscoveryOrigin, ManufacturerData, ScanMode,
};

/// True if any one of the four signals marks the device as audio-capable.
pub fn is_audio_accessory(device: &DiscoveredDevice) -> bool {
    let adv = &device.advertisement;
    name_matches(device.name.as_deref())
        || services_match(&adv.services)
        || adv.manufacturer_data.as_ref().is_some_and(manufacturer_matches)
        || service_data_matches(adv.service_data.iter().map(|(uuid, data)| (uuid, data.as_slice())))
}

/// Narrower check: only hands-free or headset profiles expose microphone control.
pub fn supports_microphone_control(device: &DiscoveredDevice) -> bool {
    device
        .advertisement
        .services
        .iter()
        .any(|uuid| MICROPHONE_CONTROL_UUIDS.contains(uuid))
}

/// Strong-signal gate. A missing RSSI never passes.
pub fn passes_rssi_gate(rssi: Option<i16>, min_rssi: i16) -> bool {
    rssi.is_some_and(|value| value >= min_rssi)
}

/// Applies the scan-mode filters and builds the accessory record.
///
/// Normal scans drop weak devices before the classifier runs; debug scans
/// surface everything. Devices the user picked in a platform chooser carry no
/// RSSI and were already filtered by the chooser, so they bypass both checks.
pub fn admit(device: DiscoveredDevice, mode: ScanMode, min_rssi: i16) -> Option<AudioAccessory> {
    let gated = mode == ScanMode::Normal && device.origin != DiscoveryOrigin::UserPicker;
    if gated && !passes_rssi_gate(device.rssi, min_rssi) {
        return None;
    }
    let accessory = describe(device);
    if gated && !accessory.has_audio_capability {
        return None;
    }
    Some(accessory)
}

/// Builds the accessory record without any filtering.
pub fn describe(device: DiscoveredDevice) -> AudioAccessory {
    let picked = device.origin == DiscoveryOrigin::UserPicker;
    AudioAccessory {
        id: device.id.clone(),
        name: device.display_name(),
        rssi: device.rssi,
        is_connected: false,
        has_audio_capability: picked || is_audio_accessory(&device),
        supports_microphone_control: supports_microphone_control(&device),
        device,
    }
}

pub fn name_matches(name: Option<&str>) -> bool {
    let Some(name) = name else {
        return false;
    };
    let lowered = name.to_lowercase();
    AUDIO_NAME_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

pub fn services_match(services: &[Uuid]) -> bool {
    services.iter().any(|uuid| AUDIO_SERVICE_UUIDS.contains(uuid))
}

pub fn manufacturer_matches(manufacturer: &ManufacturerData) -> bool {
    if AUDIO_CHIPSET_COMPANY_IDS.contains(&manufacturer.company_id) {
        return true;
    }
    as_printable_text(&manufacturer.data)
        .is_some_and(|text| AUDIO_PAYLOAD_KEYWORDS.iter().any(|keyword| text.contains(keyword)))
}

/// Checks each service-data entry: the key itself, then every reading of the
/// payload (raw bytes, hex text, base64 text).
pub fn service_data_matches<'a>(entries: impl IntoIterator<Item = (&'a Uuid, &'a [u8])>) -> bool {
    entries.into_iter().any(|(uuid, data)| {
        if AUDIO_SERVICE_UUIDS.contains(uuid) {
            return true;
        }
        service_payload_candidates(data).iter().any(|bytes| {
            contains_audio_service_id(bytes)
                || is_audio_class_of_device(bytes)
                || contains_vendor_fragment(bytes)
        })
    })
}

/// The raw payload plus whichever text decodings succeed.
pub fn service_payload_candidates(data: &[u8]) -> Vec<Vec<u8>> {
    let mut candidates = vec![data.to_vec()];
    if let Ok(text) = std::str::from_utf8(data) {
        let text = text.trim();
        let looks_hex = !text.is_empty()
            && text.len() % 2 == 0
            && text.chars().all(|c| c.is_ascii_hexdigit());
        if looks_hex {
            if let Ok(bytes) = hex::decode(text) {
                candidates.push(bytes);
            }
        }
        if text.len() >= 4 {
            if let Ok(bytes) = BASE64.decode(text) {
                candidates.push(bytes);
            }
        }
    }
    candidates
}

/// Looks for 16-bit audio profile identifiers, little endian, anywhere in the payload.
fn contains_audio_service_id(bytes: &[u8]) -> bool {
    bytes.windows(2).any(|pair| {
        let short = u16::from_le_bytes([pair[0], pair[1]]);
        AUDIO_SERVICE_UUIDS
            .iter()
            .any(|uuid| short_id(uuid) == Some(short))
    })
}

/// Interprets the first three bytes as a Class-of-Device field.
pub fn is_audio_class_of_device(bytes: &[u8]) -> bool {
    if bytes.len() < 3 {
        return false;
    }
    let cod = u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
    let major = (cod >> 8) & 0x1F;
    let minor = (cod >> 2) & 0x3F;
    major == COD_MAJOR_AUDIO_VIDEO && COD_AUDIO_MINOR_CLASSES.contains(&minor)
}

fn contains_vendor_fragment(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes).to_lowercase();
    VENDOR_NAME_FRAGMENTS.iter().any(|fragment| text.contains(fragment))
}

/// Returns the 16-bit form of a SIG base UUID.
fn short_id(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask = (1u128 << 96) - 1;
    let is_sig = value & base_mask == 0x0000_0000_0000_1000_8000_00805f9b34fb && value >> 112 == 0;
    is_sig.then(|| (value >> 96) as u16)
}

fn as_printable_text(data: &[u8]) -> Option<String> {
    let printable = data.len() >= 3 && data.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
    printable.then(|| String::from_utf8_lossy(data).to_lowercase())
}
