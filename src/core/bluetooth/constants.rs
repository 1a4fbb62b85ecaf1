//! Constants used throughout the accessory subsystem
//! This module contains the UUIDs, keyword tables, chipset identifiers and
//! timing defaults the classifier, decoders and manager agree on.

use uuid::Uuid;

/// Expands a 16-bit SIG-assigned identifier onto the Bluetooth base UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Standard Bluetooth audio profile UUIDs
pub const UUID_HEADSET_PROFILE: Uuid = sig_uuid(0x1108);
pub const UUID_A2DP_SOURCE: Uuid = sig_uuid(0x110A);
pub const UUID_A2DP_SINK: Uuid = sig_uuid(0x110B);
pub const UUID_A2DP: Uuid = sig_uuid(0x110D);
pub const UUID_HEADSET_AUDIO_GATEWAY: Uuid = sig_uuid(0x1112);
pub const UUID_HANDS_FREE: Uuid = sig_uuid(0x111E);
pub const UUID_HANDS_FREE_AUDIO_GATEWAY: Uuid = sig_uuid(0x111F);
pub const UUID_HEADSET_HS: Uuid = sig_uuid(0x1131);

/// Vendor A (Aina) PTT button service and notification characteristic
pub const UUID_AINA_SERVICE: Uuid = Uuid::from_u128(0x127face1_cb21_11e5_93d0_0002a5d5c51b);
pub const UUID_AINA_BUTTON_CHAR: Uuid = Uuid::from_u128(0x127fbeef_cb21_11e5_93d0_0002a5d5c51b);

/// Vendor B (Klein) PTT button service and notification characteristic
pub const UUID_KLEIN_SERVICE: Uuid = sig_uuid(0xFFE0);
pub const UUID_KLEIN_BUTTON_CHAR: Uuid = sig_uuid(0xFFE1);

/// Vendor C (Pryme) PTT button service and notification characteristic
pub const UUID_PRYME_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const UUID_PRYME_BUTTON_CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristics the generic decoder listens on regardless of service
pub const GENERIC_BUTTON_CHARS: [Uuid; 4] = [
    sig_uuid(0x2A4D), // HID report
    sig_uuid(0xFFE1),
    sig_uuid(0xFFF1),
    sig_uuid(0xFFF4),
];

/// Service identifiers that mark a device as an audio accessory
pub const AUDIO_SERVICE_UUIDS: [Uuid; 11] = [
    UUID_HEADSET_PROFILE,
    UUID_A2DP_SOURCE,
    UUID_A2DP_SINK,
    UUID_A2DP,
    UUID_HEADSET_AUDIO_GATEWAY,
    UUID_HANDS_FREE,
    UUID_HANDS_FREE_AUDIO_GATEWAY,
    UUID_HEADSET_HS,
    UUID_AINA_SERVICE,
    UUID_KLEIN_SERVICE,
    UUID_PRYME_SERVICE,
];

/// Profiles that imply the accessory can drive the call microphone
pub const MICROPHONE_CONTROL_UUIDS: [Uuid; 5] = [
    UUID_HEADSET_PROFILE,
    UUID_HEADSET_AUDIO_GATEWAY,
    UUID_HANDS_FREE,
    UUID_HANDS_FREE_AUDIO_GATEWAY,
    UUID_HEADSET_HS,
];

/// Lower-case name fragments of known PTT hardware vendors
pub const VENDOR_NAME_FRAGMENTS: [&str; 3] = ["aina", "klein", "pryme"];

/// Lower-case name keywords that mark a device as an audio accessory
pub const AUDIO_NAME_KEYWORDS: [&str; 9] = [
    "headset", "speaker", "mic", "ptt", "earpiece", "handsfree", "aina", "klein", "pryme",
];

/// Substrings looked for in string-like manufacturer payloads
pub const AUDIO_PAYLOAD_KEYWORDS: [&str; 5] = ["audio", "headset", "speaker", "mic", "ptt"];

/// Bluetooth SIG company identifiers of audio chipset vendors
pub const AUDIO_CHIPSET_COMPANY_IDS: [u16; 5] = [
    0x000A, // Qualcomm Technologies International (CSR)
    0x000F, // Broadcom
    0x001D, // Qualcomm
    0x0046, // MediaTek
    0x005D, // Realtek
];

/// Class-of-Device major class "Audio/Video"
pub const COD_MAJOR_AUDIO_VIDEO: u32 = 0x04;

/// Audio/Video minor classes that describe a headset-like device
pub const COD_AUDIO_MINOR_CLASSES: [u32; 7] = [
    0x01, // wearable headset
    0x02, // hands-free
    0x04, // microphone
    0x05, // loudspeaker
    0x06, // headphones
    0x07, // portable audio
    0x08, // car audio
];

/// Strong-signal gate applied before classification in normal scans (dBm)
pub const DEFAULT_MIN_RSSI: i16 = -60;

/// Scan duration in milliseconds
pub const DEFAULT_SCAN_DURATION_MS: u64 = 10_000;

/// Maximum number of connection attempts
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Size of the button-event history ring
pub const BUTTON_HISTORY_LIMIT: usize = 50;

/// Key under which the preferred device is persisted
pub const PREFERRED_DEVICE_KEY: &str = "preferred_bluetooth_device";
