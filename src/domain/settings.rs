use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
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

/// Jitter window for classic Bluetooth reconnects, half-open `[min, max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_min_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: default_reconnect_min_ms(),
            max_delay_ms: default_reconnect_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_scan_period_ms")]
    pub ble_scan_period_ms: u64,
    /// Push advertisements without a local name as scan results too.
    #[serde(default = "default_false")]
    pub report_unnamed_ble_devices: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            ble_scan_period_ms: default_scan_period_ms(),
            report_unnamed_ble_devices: false,
        }
    }
}

impl ScanSettings {
    pub fn ble_scan_period(&self) -> Duration {
        Duration::from_millis(self.ble_scan_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassicSettings {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_rfcomm_channel")]
    pub rfcomm_channel: u8,
}

impl Default for ClassicSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            rfcomm_channel: default_rfcomm_channel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_frame_terminator")]
    pub frame_terminator: u8,
    #[serde(default = "default_false")]
    pub gatt_auto_connect: bool,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            frame_terminator: default_frame_terminator(),
            gatt_auto_connect: false,
        }
    }
}

/// How the last chunk of an oversized USB payload is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalChunkPolicy {
    /// Zero-filled up to the full packet size.
    Padded,
    /// Only the remaining payload bytes.
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "default_final_chunk")]
    pub final_chunk: FinalChunkPolicy,
    #[serde(default)]
    pub interface_index: u8,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: default_transfer_timeout_ms(),
            final_chunk: default_final_chunk(),
            interface_index: 0,
        }
    }
}

impl UsbSettings {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub classic: ClassicSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub usb: UsbSettings,
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
    "printer_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_reconnect_min_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    5000
}
fn default_scan_period_ms() -> u64 {
    4000
}
fn default_read_buffer_size() -> usize {
    1024
}
fn default_rfcomm_channel() -> u8 {
    1
}
fn default_frame_terminator() -> u8 {
    0x0D
}
fn default_transfer_timeout_ms() -> u64 {
    100_000
}
fn default_final_chunk() -> FinalChunkPolicy {
    FinalChunkPolicy::Padded
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is missing or malformed.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("printer-link");
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
}
