//! Octo Bed Protocol
//!
//! Fixed command frames, the diagnostic frame builder and notification
//! classification. Everything here is pure: no I/O, no state.

use crate::domain::models::{Direction, Pin, PinResponse, Section};
use std::fmt;
use uuid::Uuid;

/// Bed control service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Command/notify characteristic UUID - every frame is written here and
/// every notification arrives here
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Frame delimiter; every frame starts and ends with it
pub const FRAME_DELIMITER: u8 = 0x40;

const KEEP_ALIVE_PREFIX: [u8; 6] = [0x40, 0x20, 0x43, 0x00, 0x04, 0x00];
const SET_PIN_PREFIX: [u8; 8] = [0x40, 0x20, 0x3C, 0x04, 0x00, 0x04, 0x02, 0x01];

/// Named commands with fixed frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BedCommand {
    Stop,
    HeadUp,
    HeadDown,
    FeetUp,
    FeetDown,
    BothUp,
    BothDown,
    /// Under-bed light on until the device's own timer expires
    LightOn,
    LightOff,
    LightOnPermanent,
    LightOffPermanent,
    MakeDiscoverable,
    SoftReset,
    /// Sent instead of the keep-alive frame once the device reports no PIN
    AppInit,
}

impl BedCommand {
    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Stop => &[0x40, 0x02, 0x73, 0x00, 0x00, 0x0B, 0x40],
            Self::HeadUp => &[0x40, 0x02, 0x70, 0x00, 0x01, 0x0B, 0x02, 0x40],
            Self::HeadDown => &[0x40, 0x02, 0x71, 0x00, 0x01, 0x0A, 0x02, 0x40],
            Self::FeetUp => &[0x40, 0x02, 0x70, 0x00, 0x01, 0x09, 0x04, 0x40],
            Self::FeetDown => &[0x40, 0x02, 0x71, 0x00, 0x01, 0x08, 0x04, 0x40],
            Self::BothUp => &[0x40, 0x02, 0x70, 0x00, 0x01, 0x07, 0x06, 0x40],
            Self::BothDown => &[0x40, 0x02, 0x71, 0x00, 0x01, 0x06, 0x06, 0x40],
            Self::LightOn => &[
                0x40, 0x20, 0x72, 0x00, 0x08, 0xDE, 0x00, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01, 0x01,
                0x40,
            ],
            Self::LightOff => &[
                0x40, 0x20, 0x72, 0x00, 0x08, 0xDF, 0x00, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01, 0x00,
                0x40,
            ],
            Self::LightOnPermanent => &[
                0x40, 0x20, 0x72, 0x00, 0x08, 0xDE, 0x00, 0x01, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01,
                0x40,
            ],
            Self::LightOffPermanent => &[
                0x40, 0x20, 0x72, 0x00, 0x08, 0xDE, 0x00, 0x01, 0x03, 0x01, 0x01, 0x01, 0x01, 0x00,
                0x40,
            ],
            Self::MakeDiscoverable => &[
                0x40, 0x20, 0x72, 0x00, 0x08, 0xD1, 0x00, 0x00, 0x10, 0x01, 0x01, 0x01, 0x01, 0x01,
                0x40,
            ],
            Self::SoftReset => &[0x40, 0x20, 0xAE, 0x00, 0x00, 0xB2, 0x40],
            Self::AppInit => &[0x40, 0x20, 0x7F, 0x00, 0x00, 0xE1, 0x40],
        }
    }

    /// Directional command for a section
    pub fn movement(section: Section, direction: Direction) -> Self {
        match (section, direction) {
            (Section::Head, Direction::Up) => Self::HeadUp,
            (Section::Head, Direction::Down) => Self::HeadDown,
            (Section::Feet, Direction::Up) => Self::FeetUp,
            (Section::Feet, Direction::Down) => Self::FeetDown,
            (Section::Both, Direction::Up) => Self::BothUp,
            (Section::Both, Direction::Down) => Self::BothDown,
        }
    }

    /// Light frame for the requested state
    pub fn light(on: bool, permanent: bool) -> Self {
        match (on, permanent) {
            (true, false) => Self::LightOn,
            (false, false) => Self::LightOff,
            (true, true) => Self::LightOnPermanent,
            (false, true) => Self::LightOffPermanent,
        }
    }
}

/// Keep-alive / authentication frame carrying the PIN digits
pub fn keep_alive_frame(pin: &Pin) -> Vec<u8> {
    let mut frame = Vec::with_capacity(KEEP_ALIVE_PREFIX.len() + 5);
    frame.extend_from_slice(&KEEP_ALIVE_PREFIX);
    frame.extend_from_slice(&pin.digits());
    frame.push(FRAME_DELIMITER);
    frame
}

/// Frame that replaces the device PIN
pub fn set_pin_frame(pin: &Pin) -> Vec<u8> {
    let mut frame = Vec::with_capacity(SET_PIN_PREFIX.len() + 5);
    frame.extend_from_slice(&SET_PIN_PREFIX);
    frame.extend_from_slice(&pin.digits());
    frame.push(FRAME_DELIMITER);
    frame
}

/// Opcode family used by the diagnostic builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticFamily {
    /// 7-byte `40 20 OP 00 00 CK 40`
    Short,
    /// 15-byte frame sharing the light/discoverable layout, OP at offset 5
    Seventy2,
}

impl fmt::Display for DiagnosticFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short => f.write_str("short"),
            Self::Seventy2 => f.write_str("72"),
        }
    }
}

impl std::str::FromStr for DiagnosticFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "short" => Ok(Self::Short),
            "72" | "seventy2" => Ok(Self::Seventy2),
            other => Err(format!("unknown diagnostic family: {other}")),
        }
    }
}

/// Checksum of a short-family frame: `(opcode + checksum) mod 256 == 0x60`
pub fn short_checksum(opcode: u8) -> u8 {
    ((0x160u16 - opcode as u16) & 0xFF) as u8
}

/// Build a diagnostic frame for a (family, opcode) pair
pub fn diagnostic_frame(family: DiagnosticFamily, opcode: u8) -> Vec<u8> {
    match family {
        DiagnosticFamily::Short => vec![
            0x40,
            0x20,
            opcode,
            0x00,
            0x00,
            short_checksum(opcode),
            0x40,
        ],
        DiagnosticFamily::Seventy2 => vec![
            0x40, 0x20, 0x72, 0x00, 0x08, opcode, 0x00, 0x00, 0x10, 0x01, 0x01, 0x01, 0x01, 0x01,
            0x40,
        ],
    }
}

/// Classify a notification received on the command characteristic
///
/// # Notification Structure
///
/// ```text
/// [0]   : 0x40 (normal) or 0x46 (alternate firmware)
/// [1]   : 0x21 (response to a 0x20 request)
/// [2-4] : echoed opcode and length
/// [5]   : status byte; for frames shorter than 6 bytes the last byte
///         0x1A            accepted
///         0x18 0x1B 0x00  rejected
///         0x1F            no PIN configured
/// ```
pub fn parse_notification(bytes: &[u8]) -> PinResponse {
    if bytes.len() < 2 || bytes[1] != 0x21 || !matches!(bytes[0], 0x40 | 0x46) {
        return PinResponse::Unknown;
    }

    let status = match bytes.get(5) {
        Some(status) => *status,
        None => bytes[bytes.len() - 1],
    };

    match status {
        0x1A => PinResponse::Accepted,
        0x18 | 0x1B | 0x00 => PinResponse::Rejected,
        0x1F => PinResponse::NoPinSet,
        _ => PinResponse::Unknown,
    }
}

/// Hex rendering used in logs and the console
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ordered candidate list scanned by the diagnostic scanner
pub const DIAGNOSTIC_CANDIDATES: &[(DiagnosticFamily, u8)] = &[
    (DiagnosticFamily::Short, 0x70),
    (DiagnosticFamily::Short, 0x71),
    (DiagnosticFamily::Short, 0x7F),
    (DiagnosticFamily::Short, 0xAD),
    (DiagnosticFamily::Short, 0xAF),
    (DiagnosticFamily::Seventy2, 0xD0),
    (DiagnosticFamily::Seventy2, 0xD2),
];
