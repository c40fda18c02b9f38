use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    // stderr is usually captured by the parent process, not a terminal
    #[serde(default = "default_false")]
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
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_false(),
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
    "deskbike_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_measurement_uuid")]
    pub measurement_uuid: String,
    /// Also accept devices whose advertised name starts with this prefix.
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Pin scanning and connecting to one adapter, e.g. "hci0".
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_scan_settle_ms")]
    pub scan_settle_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetrySettings,
    #[serde(default = "default_discovery_retry")]
    pub discovery_retry: RetrySettings,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            measurement_uuid: default_measurement_uuid(),
            name_prefix: None,
            adapter: None,
            resolve_timeout_ms: default_resolve_timeout_ms(),
            scan_settle_ms: default_scan_settle_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retry: default_connect_retry(),
            discovery_retry: default_discovery_retry(),
        }
    }
}

fn default_service_uuid() -> String {
    "00001816-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_measurement_uuid() -> String {
    "00002a5b-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_resolve_timeout_ms() -> u64 {
    4000
}
fn default_scan_settle_ms() -> u64 {
    200
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_connect_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        delay_ms: 400,
    }
}
fn default_discovery_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        delay_ms: 250,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default = "default_wheel_circumference_m")]
    pub wheel_circumference_m: f64,
    #[serde(default = "default_false")]
    pub reset_distance_on_reconnect: bool,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            wheel_circumference_m: default_wheel_circumference_m(),
            reset_distance_on_reconnect: default_false(),
        }
    }
}

fn default_wheel_circumference_m() -> f64 {
    crate::domain::csc::DEFAULT_WHEEL_CIRCUMFERENCE_M
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Forward every raw notification as a `data` event.
    #[serde(default = "default_true")]
    pub emit_raw: bool,
    #[serde(default = "default_max_samples_per_sec")]
    pub max_samples_per_sec: f64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            emit_raw: default_true(),
            max_samples_per_sec: default_max_samples_per_sec(),
        }
    }
}

fn default_max_samples_per_sec() -> f64 {
    4.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default)]
    pub ble: BleSettings,

    // Sensor Calibration
    #[serde(default)]
    pub sensor: SensorSettings,

    // Boundary Output
    #[serde(default)]
    pub telemetry: TelemetrySettings,

    // Debug Settings
    #[serde(default = "default_false")]
    pub mock_ble: bool,
    /// Speed ridden by the simulated bike when `mock_ble` is set.
    #[serde(default = "default_mock_speed_kmh")]
    pub mock_speed_kmh: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble: BleSettings::default(),
            sensor: SensorSettings::default(),
            telemetry: TelemetrySettings::default(),
            mock_ble: default_false(),
            mock_speed_kmh: default_mock_speed_kmh(),
        }
    }
}

fn default_mock_speed_kmh() -> f64 {
    17.5
}

impl Settings {
    /// Apply environment overrides on top of the file values.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(adapter) = lookup("BLE_ADAPTER").filter(|a| !a.trim().is_empty()) {
            self.ble.adapter = Some(adapter.trim().to_string());
        }
        if let Some(mock) = lookup("MOCK_BLE") {
            match mock.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.mock_ble = true,
                "0" | "false" | "no" => self.mock_ble = false,
                _ => {}
            }
        }
        if let Some(circumference) = lookup("DESKBIKE_WHEEL_CIRCUMFERENCE_M")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
        {
            self.sensor.wheel_circumference_m = circumference;
        }
        if let Some(speed) = lookup("DESKBIKE_MOCK_SPEED_KMH")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
        {
            self.mock_speed_kmh = speed;
        }
    }

    /// Put unusable file values back to their defaults.
    ///
    /// Returns one message per replaced value.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut replaced = Vec::new();

        let circumference = self.sensor.wheel_circumference_m;
        if !(circumference.is_finite() && circumference > 0.0) {
            self.sensor.wheel_circumference_m = default_wheel_circumference_m();
            replaced.push(format!(
                "sensor.wheel_circumference_m must be a positive length, got {}; using {}",
                circumference, self.sensor.wheel_circumference_m
            ));
        }

        let speed = self.mock_speed_kmh;
        if !(speed.is_finite() && speed >= 0.0) {
            self.mock_speed_kmh = default_mock_speed_kmh();
            replaced.push(format!(
                "mock_speed_kmh must not be negative, got {}; using {}",
                speed, self.mock_speed_kmh
            ));
        }

        replaced
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
    load_warning: Option<String>,
}

impl SettingsService {
    /// Load settings from the default location, then apply environment overrides.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path();
        let mut service = match &settings_path {
            Some(path) => Self::from_path(path),
            None => Self {
                settings: Settings::default(),
                settings_path: None,
                load_warning: Some("could not determine config directory".to_string()),
            },
        };
        service
            .settings
            .apply_env_overrides(|key| std::env::var(key).ok());
        Ok(service)
    }

    /// Load settings from `path`, falling back to defaults when missing or invalid.
    pub fn from_path(path: &Path) -> Self {
        let (mut settings, mut warnings) = match Self::load_from_file(path) {
            Ok(settings) => (settings, Vec::new()),
            Err(e) if Self::is_not_found(&e) => (Settings::default(), Vec::new()),
            Err(e) => (
                Settings::default(),
                vec![format!("ignoring settings file {}: {}", path.display(), e)],
            ),
        };
        warnings.extend(settings.sanitize());
        let load_warning = (!warnings.is_empty()).then(|| warnings.join("; "));
        Self {
            settings,
            settings_path: Some(path.to_path_buf()),
            load_warning,
        }
    }

    fn get_settings_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("DESKBIKE_SETTINGS") {
            return Some(PathBuf::from(explicit));
        }
        let mut path = dirs::config_dir()?;
        path.push("DeskBike");
        path.push("ble_helper.json");
        Some(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    fn is_not_found(error: &anyhow::Error) -> bool {
        error
            .downcast_ref::<std::io::Error>()
            .map_or(false, |e| e.kind() == std::io::ErrorKind::NotFound)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    /// Problem hit while loading, reported once logging is initialized.
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }
}
