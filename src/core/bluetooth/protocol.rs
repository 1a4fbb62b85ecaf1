//! PTT button protocol decoders
//!
//! Every supported headset family pushes short button frames on its own
//! service/characteristic pair. The decoders below turn such a frame into a
//! [`ButtonEvent`]. Byte 0 carries the button code unless noted otherwise.
//!
//! ```text
//! Vendor A (Aina)   [code] [0xFF = long press]
//!                   0x00 stop | 0x01 start | 0x02 mute | 0x03 vol+ | 0x04 vol-
//!
//! Vendor B (Klein)  [code|0x80 = long press] [0x01/0xFF = long, 0x02 = double]
//!                   new:    0x00 stop | 0x01 start | 0x02 mute | 0x03 vol+ | 0x04 vol- | 0x05 mute
//!                   legacy: 0x10 start | 0x11 stop | 0x20 mute | 0x30 vol+ | 0x40 vol-
//!                   pairs:  43,80 start | 43,82 stop
//!
//! Vendor C (Pryme)  [code] [0x01 = long, 0x02 = double]
//!                   0x00 stop | 0x01 start | 0x02 mute | 0x03 vol+ | 0x04 vol- | 0x05 special
//!
//! Generic           [flags|nibble]
//!                   nibble: 0 stop | 1 start | 2 vol+ | 3 vol- | 4 mute
//!                   0x80 long press, 0x40 double press
//! ```

use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    GENERIC_BUTTON_CHARS, UUID_AINA_BUTTON_CHAR, UUID_AINA_SERVICE, UUID_KLEIN_BUTTON_CHAR,
    UUID_KLEIN_SERVICE, UUID_PRYME_BUTTON_CHAR, UUID_PRYME_SERVICE,
};
use crate::core::bluetooth::types::{Button, ButtonEvent, PressType};
use crate::error::AccessoryError;

/// Hardware families with a dedicated decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    Aina,
    Klein,
    Pryme,
    Generic,
}

const VENDOR_ENDPOINTS: [(Uuid, Uuid, Vendor); 3] = [
    (UUID_AINA_SERVICE, UUID_AINA_BUTTON_CHAR, Vendor::Aina),
    (UUID_KLEIN_SERVICE, UUID_KLEIN_BUTTON_CHAR, Vendor::Klein),
    (UUID_PRYME_SERVICE, UUID_PRYME_BUTTON_CHAR, Vendor::Pryme),
];

impl Vendor {
    /// Picks the decoder for a notification source.
    ///
    /// Exact vendor service/characteristic pairs win; otherwise any well-known
    /// generic button characteristic falls back to the generic decoder.
    pub fn for_endpoint(service: Uuid, characteristic: Uuid) -> Option<Vendor> {
        VENDOR_ENDPOINTS
            .iter()
            .find(|(s, c, _)| *s == service && *c == characteristic)
            .map(|(_, _, vendor)| *vendor)
            .or_else(|| GENERIC_BUTTON_CHARS.contains(&characteristic).then_some(Vendor::Generic))
    }

    pub fn decode(self, frame: &[u8]) -> Option<ButtonEvent> {
        match self {
            Vendor::Aina => decode_aina(frame),
            Vendor::Klein => decode_klein(frame),
            Vendor::Pryme => decode_pryme(frame),
            Vendor::Generic => decode_generic(frame),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Vendor::Aina => "aina",
            Vendor::Klein => "klein",
            Vendor::Pryme => "pryme",
            Vendor::Generic => "generic",
        };
        f.write_str(label)
    }
}

impl FromStr for Vendor {
    type Err = AccessoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aina" | "a" => Ok(Vendor::Aina),
            "klein" | "b" => Ok(Vendor::Klein),
            "pryme" | "c" => Ok(Vendor::Pryme),
            "generic" => Ok(Vendor::Generic),
            other => Err(AccessoryError::InvalidFrame(format!("unknown vendor '{}'", other))),
        }
    }
}

/// Decodes a notification by its service/characteristic source.
/// Returns `None` for unknown sources and for empty frames.
pub fn decode_notification(service: Uuid, characteristic: Uuid, frame: &[u8]) -> Option<ButtonEvent> {
    let vendor = Vendor::for_endpoint(service, characteristic)?;
    let event = vendor.decode(frame);
    if event.is_none() {
        debug!("Skipped empty {} frame from {}/{}", vendor, service, characteristic);
    }
    event
}

/// Offline decoding of a hex-encoded frame, for verifying new hardware
/// without a live device. Accepts separators such as spaces, `:` and `-`
/// and an optional `0x` prefix.
pub fn test_button_mapping(vendor: Vendor, hex_frame: &str) -> Result<Option<ButtonEvent>, AccessoryError> {
    let frame = parse_hex_frame(hex_frame)?;
    Ok(vendor.decode(&frame))
}

pub fn parse_hex_frame(hex_frame: &str) -> Result<Vec<u8>, AccessoryError> {
    let trimmed = hex_frame.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = without_prefix
        .chars()
        .filter(|c| !matches!(c, ' ' | ':' | '-' | ','))
        .collect();
    hex::decode(&digits).map_err(|e| AccessoryError::InvalidFrame(format!("'{}': {}", hex_frame, e)))
}

fn unknown_code(vendor: Vendor, frame: &[u8]) {
    warn!("Unknown {} button code in frame {:02X?}", vendor, frame);
}

fn standard_button(code: u8) -> Option<Button> {
    match code {
        0x00 => Some(Button::PttStop),
        0x01 => Some(Button::PttStart),
        0x02 => Some(Button::Mute),
        0x03 => Some(Button::VolumeUp),
        0x04 => Some(Button::VolumeDown),
        _ => None,
    }
}

/// Vendor A: byte 1 == 0xFF marks a long press.
pub fn decode_aina(frame: &[u8]) -> Option<ButtonEvent> {
    let code = *frame.first()?;
    let button = standard_button(code).unwrap_or_else(|| {
        unknown_code(Vendor::Aina, frame);
        Button::Unknown
    });
    let press_type = match frame.get(1) {
        Some(0xFF) => PressType::LongPress,
        _ => PressType::Press,
    };
    Some(ButtonEvent::new(Vendor::Aina, button, press_type, frame))
}

const KLEIN_LONG_PRESS_BIT: u8 = 0x80;
const KLEIN_PAIR_PREFIX: u8 = 43;
const KLEIN_PAIR_START: u8 = 80;
const KLEIN_PAIR_STOP: u8 = 82;

/// Vendor B button lookup on a code with the long-press bit already removed.
/// The "new" table is consulted before the legacy one.
pub fn klein_button(base_code: u8) -> Option<Button> {
    match base_code {
        0x05 => Some(Button::Mute),
        0x10 => Some(Button::PttStart),
        0x11 => Some(Button::PttStop),
        0x20 => Some(Button::Mute),
        0x30 => Some(Button::VolumeUp),
        0x40 => Some(Button::VolumeDown),
        code => standard_button(code),
    }
}

/// Vendor B press type, independent of the button table.
pub fn klein_press_type(frame: &[u8]) -> PressType {
    if frame.first().is_some_and(|code| code & KLEIN_LONG_PRESS_BIT != 0) {
        return PressType::LongPress;
    }
    match frame.get(1) {
        Some(0x01) | Some(0xFF) => PressType::LongPress,
        Some(0x02) => PressType::DoublePress,
        _ => PressType::Press,
    }
}

/// Vendor B: table lookup on the masked code plus an independent press-type pass.
pub fn decode_klein(frame: &[u8]) -> Option<ButtonEvent> {
    let code = *frame.first()?;

    let pair_button = match (code, frame.get(1).copied()) {
        (KLEIN_PAIR_PREFIX, Some(KLEIN_PAIR_START)) => Some(Button::PttStart),
        (KLEIN_PAIR_PREFIX, Some(KLEIN_PAIR_STOP)) => Some(Button::PttStop),
        _ => None,
    };
    if let Some(button) = pair_button {
        return Some(ButtonEvent::new(Vendor::Klein, button, PressType::Press, frame));
    }

    let button = klein_button(code & !KLEIN_LONG_PRESS_BIT).unwrap_or_else(|| {
        unknown_code(Vendor::Klein, frame);
        Button::Unknown
    });
    Some(ButtonEvent::new(Vendor::Klein, button, klein_press_type(frame), frame))
}

/// Vendor C: byte 1 == 0x01 long press, 0x02 double press.
pub fn decode_pryme(frame: &[u8]) -> Option<ButtonEvent> {
    let code = *frame.first()?;
    let button = match code {
        0x05 => {
            debug!("Pryme special key pressed: {:02X?}", frame);
            Button::Unknown
        }
        code => standard_button(code).unwrap_or_else(|| {
            unknown_code(Vendor::Pryme, frame);
            Button::Unknown
        }),
    };
    let press_type = match frame.get(1) {
        Some(0x01) => PressType::LongPress,
        Some(0x02) => PressType::DoublePress,
        _ => PressType::Press,
    };
    Some(ButtonEvent::new(Vendor::Pryme, button, press_type, frame))
}

/// Generic fallback: low nibble is the button, high bits are press flags.
pub fn decode_generic(frame: &[u8]) -> Option<ButtonEvent> {
    let code = *frame.first()?;
    let button = match code & 0x0F {
        0x0 => Button::PttStop,
        0x1 => Button::PttStart,
        0x2 => Button::VolumeUp,
        0x3 => Button::VolumeDown,
        0x4 => Button::Mute,
        _ => {
            unknown_code(Vendor::Generic, frame);
            Button::Unknown
        }
    };
    let press_type = if code & 0x80 != 0 {
        PressType::LongPress
    } else if code & 0x40 != 0 {
        PressType::DoublePress
    } else {
        PressType::Press
    };
    Some(ButtonEvent::new(Vendor::Generic, button, press_type, frame))
}
