use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Shortest accepted full-travel duration for one axis.
pub const MIN_CALIBRATION_MS: u64 = 1_000;
/// Longest accepted full-travel duration for one axis.
pub const MAX_CALIBRATION_MS: u64 = 120_000;

/// Six-byte Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct InvalidMacAddress(pub String);

impl FromStr for MacAddress {
    type Err = InvalidMacAddress;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` or 12 bare hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidMacAddress(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| InvalidMacAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Four-digit numeric PIN, stored as digit values 0-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin([u8; 4]);

impl Pin {
    /// Normalises free-form input: non-digits are dropped, the first four
    /// digits are kept and shorter input is left-padded with `0`.
    pub fn normalize(raw: &str) -> Self {
        let digits: Vec<u8> = raw
            .chars()
            .filter_map(|c| c.to_digit(10))
            .map(|d| d as u8)
            .take(4)
            .collect();

        let mut pin = [0u8; 4];
        let offset = 4 - digits.len();
        pin[offset..].copy_from_slice(&digits);
        Self(pin)
    }

    /// Digit values as sent on the wire.
    pub fn digits(&self) -> [u8; 4] {
        self.0
    }
}

impl Default for Pin {
    fn default() -> Self {
        Self([0; 4])
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.0 {
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl Serialize for Pin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Pin::normalize(&raw))
    }
}

/// Identity and credentials of the configured bed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub address: Option<MacAddress>,
    pub name: String,
    pub pin: Pin,
    pub nickname: Option<String>,
    pub title: Option<String>,
}

pub const DEFAULT_TITLE: &str = "Octo Bed";

impl DeviceRecord {
    /// Title derived from nickname, then address, then advertised name.
    pub fn derived_title(&self) -> String {
        if let Some(nickname) = self.nickname.as_deref().map(str::trim) {
            if !nickname.is_empty() {
                return format!("{DEFAULT_TITLE} ({nickname})");
            }
        }
        match self.address {
            Some(address) => format!("{DEFAULT_TITLE} ({address})"),
            None => format!("{DEFAULT_TITLE} ({})", self.name),
        }
    }

    /// True when the title was never customised and may be regenerated.
    pub fn title_is_generic(&self) -> bool {
        match self.title.as_deref() {
            None => true,
            Some(title) => {
                let compact: String = title.chars().filter(|c| !c.is_whitespace()).collect();
                title.trim().is_empty() || title == DEFAULT_TITLE || compact.contains("()")
            }
        }
    }

    pub fn display_title(&self) -> String {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title.to_string(),
            _ => self.derived_title(),
        }
    }
}

/// One independently driven section of the bed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Head,
    Feet,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Head => f.write_str("head"),
            Axis::Feet => f.write_str("feet"),
        }
    }
}

/// Target of a movement request: a single axis or both together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Head,
    Feet,
    Both,
}

impl Section {
    pub fn axes(&self) -> &'static [Axis] {
        match self {
            Section::Head => &[Axis::Head],
            Section::Feet => &[Axis::Feet],
            Section::Both => &[Axis::Head, Axis::Feet],
        }
    }
}

impl From<Axis> for Section {
    fn from(axis: Axis) -> Self {
        match axis {
            Axis::Head => Section::Head,
            Axis::Feet => Section::Feet,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Head => f.write_str("head"),
            Section::Feet => f.write_str("feet"),
            Section::Both => f.write_str("both"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Direction that moves `current` toward `target`.
    pub fn toward(current: f64, target: f64) -> Self {
        if target > current {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    /// Position at which streaming in this direction can go no further.
    pub fn limit(&self) -> f64 {
        match self {
            Direction::Up => 100.0,
            Direction::Down => 0.0,
        }
    }
}

/// Estimated position of both axes, percent of full travel.
///
/// Positions are a timing-based estimate, never read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisPosition {
    head: f64,
    feet: f64,
}

impl AxisPosition {
    pub fn new(head: f64, feet: f64) -> Self {
        Self {
            head: clamp_percent(head),
            feet: clamp_percent(feet),
        }
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Head => self.head,
            Axis::Feet => self.feet,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        let value = clamp_percent(value);
        match axis {
            Axis::Head => self.head = value,
            Axis::Feet => self.feet = value,
        }
    }

    pub fn head(&self) -> f64 {
        self.head
    }

    pub fn feet(&self) -> f64 {
        self.feet
    }
}

pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// Measured full-travel duration per axis, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationConstant {
    head_ms: u64,
    feet_ms: u64,
}

impl CalibrationConstant {
    pub fn new(head_ms: u64, feet_ms: u64) -> Self {
        Self {
            head_ms: clamp_calibration_ms(head_ms),
            feet_ms: clamp_calibration_ms(feet_ms),
        }
    }

    pub fn from_secs(head_secs: f64, feet_secs: f64) -> Self {
        Self::new(secs_to_ms(head_secs), secs_to_ms(feet_secs))
    }

    pub fn get(&self, axis: Axis) -> u64 {
        match axis {
            Axis::Head => self.head_ms,
            Axis::Feet => self.feet_ms,
        }
    }

    pub fn set(&mut self, axis: Axis, ms: u64) {
        let ms = clamp_calibration_ms(ms);
        match axis {
            Axis::Head => self.head_ms = ms,
            Axis::Feet => self.feet_ms = ms,
        }
    }

    pub fn duration(&self, axis: Axis) -> Duration {
        Duration::from_millis(self.get(axis))
    }
}

pub fn clamp_calibration_ms(ms: u64) -> u64 {
    ms.clamp(MIN_CALIBRATION_MS, MAX_CALIBRATION_MS)
}

fn secs_to_ms(secs: f64) -> u64 {
    if !secs.is_finite() || secs <= 0.0 {
        return MIN_CALIBRATION_MS;
    }
    (secs * 1000.0) as u64
}

/// Connection status as reported to adapters. Recomputed each poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No address known yet.
    Searching,
    /// Address known but not currently observed by any adapter.
    Disconnected,
    /// Observed, but the last authentication failed or has not happened.
    PinNotAccepted,
    /// Observed and the last authentication succeeded.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Searching => f.write_str("searching for device"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::PinNotAccepted => f.write_str("PIN not accepted"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Classification of a notification received after an authentication frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinResponse {
    Accepted,
    Rejected,
    NoPinSet,
    Unknown,
}

/// What the device's silence told us when no classifying notification arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    StayedConnected,
    Disconnected,
}

/// Result of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    /// Device reports no PIN configured; app-init frames are used from now on.
    NoPinSet,
    Rejected,
    /// No explicit notification; only connectivity was observed.
    Ambiguous(Connectivity),
}

impl AuthOutcome {
    /// Whether commands may be sent on this session.
    pub fn permits_commands(&self) -> bool {
        matches!(
            self,
            AuthOutcome::Accepted
                | AuthOutcome::NoPinSet
                | AuthOutcome::Ambiguous(Connectivity::StayedConnected)
        )
    }
}

/// Outcome of sending a deliberately wrong PIN during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheckProbe {
    /// Explicit rejection notification.
    Rejected,
    /// Silent disconnect; the device still validates PINs.
    Disconnected,
    /// Stayed connected with no notification; PINs are not enforced.
    NotEnforced,
}

/// Setup-time PIN verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinValidation {
    Valid,
    WrongPin,
    NoPinCheck,
    ConnectionFailed,
}

/// Live calibration progress for UI polling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProgress {
    pub axis: Axis,
    pub elapsed: Duration,
    /// Elapsed time as a percentage of the caller's reference duration, capped at 100.
    pub percent_of_reference: f64,
}

/// Everything an adapter needs to render current state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub head_position: f64,
    pub feet_position: f64,
    pub light_on: bool,
    pub connection: ConnectionState,
    pub last_auth: Option<AuthOutcome>,
    pub movement_active: bool,
    pub calibration_active: bool,
    pub address: Option<MacAddress>,
    pub title: String,
    pub last_notification: Option<Vec<u8>>,
}
