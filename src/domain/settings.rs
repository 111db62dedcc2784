use crate::domain::models::{
    Axis, AxisPosition, CalibrationConstant, DeviceRecord, MacAddress, Pin,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "octo_bed".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// BLE timing knobs. Defaults come from field captures of the bed and relays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pin_response_wait_ms")]
    pub pin_response_wait_ms: u64,
    /// Extra wait after a silent PIN response before checking connectivity
    #[serde(default = "default_settle_wait_ms")]
    pub settle_wait_ms: u64,
    #[serde(default = "default_cadence_ms")]
    pub movement_cadence_ms: u64,
    #[serde(default = "default_active_keep_alive_secs")]
    pub active_keep_alive_secs: u64,
    #[serde(default = "default_idle_keep_alive_secs")]
    pub idle_keep_alive_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_diagnostic_delay_ms")]
    pub diagnostic_delay_ms: u64,
    #[serde(default = "default_resume_attempts")]
    pub resume_attempts: u32,
    #[serde(default = "default_stop_wait_secs")]
    pub stop_wait_secs: u64,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pin_response_wait_ms: default_pin_response_wait_ms(),
            settle_wait_ms: default_settle_wait_ms(),
            movement_cadence_ms: default_cadence_ms(),
            active_keep_alive_secs: default_active_keep_alive_secs(),
            idle_keep_alive_secs: default_idle_keep_alive_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            diagnostic_delay_ms: default_diagnostic_delay_ms(),
            resume_attempts: default_resume_attempts(),
            stop_wait_secs: default_stop_wait_secs(),
        }
    }
}

impl BleSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn pin_response_wait(&self) -> Duration {
        Duration::from_millis(self.pin_response_wait_ms)
    }
    pub fn settle_wait(&self) -> Duration {
        Duration::from_millis(self.settle_wait_ms)
    }
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.movement_cadence_ms.max(50))
    }
    pub fn active_keep_alive(&self) -> Duration {
        Duration::from_secs(self.active_keep_alive_secs.max(1))
    }
    pub fn idle_keep_alive(&self) -> Duration {
        Duration::from_secs(self.idle_keep_alive_secs.max(1))
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
    pub fn diagnostic_delay(&self) -> Duration {
        Duration::from_millis(self.diagnostic_delay_ms)
    }
    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_wait_secs)
    }
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_pin_response_wait_ms() -> u64 {
    3_000
}
fn default_settle_wait_ms() -> u64 {
    1_750
}
fn default_cadence_ms() -> u64 {
    300
}
fn default_active_keep_alive_secs() -> u64 {
    15
}
fn default_idle_keep_alive_secs() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_diagnostic_delay_ms() -> u64 {
    250
}
fn default_resume_attempts() -> u32 {
    3
}
fn default_stop_wait_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub device_address: Option<MacAddress>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pin: Pin,

    // Calibration, seconds of full travel
    #[serde(default = "default_calibration_secs")]
    pub head_calibration_secs: f64,
    #[serde(default = "default_calibration_secs")]
    pub feet_calibration_secs: f64,

    // Last estimated positions, percent
    #[serde(default)]
    pub head_position: f64,
    #[serde(default)]
    pub feet_position: f64,

    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            device_address: None,
            nickname: None,
            title: None,
            pin: Pin::default(),
            head_calibration_secs: default_calibration_secs(),
            feet_calibration_secs: default_calibration_secs(),
            head_position: 0.0,
            feet_position: 0.0,
            log_settings: LogSettings::default(),
            ble: BleSettings::default(),
        }
    }
}

fn default_device_name() -> String {
    "RC2".to_string()
}
fn default_calibration_secs() -> f64 {
    30.0
}

/// Clamp a configured calibration to the accepted 1-120 s range.
pub fn clamp_calibration_secs(secs: f64) -> f64 {
    if !secs.is_finite() {
        return default_calibration_secs();
    }
    secs.clamp(1.0, 120.0)
}

impl Settings {
    pub fn device_record(&self) -> DeviceRecord {
        DeviceRecord {
            address: self.device_address,
            name: self.device_name.clone(),
            pin: self.pin,
            nickname: self.nickname.clone(),
            title: self.title.clone(),
        }
    }

    pub fn calibration(&self) -> CalibrationConstant {
        CalibrationConstant::from_secs(
            clamp_calibration_secs(self.head_calibration_secs),
            clamp_calibration_secs(self.feet_calibration_secs),
        )
    }

    pub fn position(&self) -> AxisPosition {
        AxisPosition::new(self.head_position, self.feet_position)
    }

    fn normalize(&mut self) {
        self.head_calibration_secs = clamp_calibration_secs(self.head_calibration_secs);
        self.feet_calibration_secs = clamp_calibration_secs(self.feet_calibration_secs);
        let position = self.position();
        self.head_position = position.head();
        self.feet_position = position.feet();
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

pub type SharedSettings = Arc<Mutex<SettingsService>>;

/// Lock shared settings. The guarded value is plain data, so a poisoned lock is still usable.
pub fn lock_settings(settings: &Mutex<SettingsService>) -> MutexGuard<'_, SettingsService> {
    settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Settings backed by an explicit file; missing or unreadable files yield defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let mut settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(path = %settings_path.display(), "Using default settings: {}", e);
                Settings::default()
            }
        };
        settings.normalize();

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("OctoBed");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn update_calibration(&mut self, axis: Axis, secs: f64) -> anyhow::Result<()> {
        let secs = clamp_calibration_secs(secs);
        match axis {
            Axis::Head => self.settings.head_calibration_secs = secs,
            Axis::Feet => self.settings.feet_calibration_secs = secs,
        }
        self.save()
    }

    pub fn update_positions(&mut self, position: AxisPosition) -> anyhow::Result<()> {
        self.settings.head_position = position.head();
        self.settings.feet_position = position.feet();
        self.save()
    }

    /// Store a discovered address, regenerating the title unless it was customised.
    pub fn set_address(&mut self, address: Option<MacAddress>) -> anyhow::Result<()> {
        self.settings.device_address = address;
        let record = self.settings.device_record();
        if record.title_is_generic() {
            self.settings.title = Some(record.derived_title());
        }
        self.save()
    }

    pub fn set_pin(&mut self, pin: Pin) -> anyhow::Result<()> {
        self.settings.pin = pin;
        self.save()
    }
}
