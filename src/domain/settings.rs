use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
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
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
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
    "usbmux_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address of the local device-multiplexer daemon.
    #[serde(default = "default_mux_addr")]
    pub mux_addr: String,

    /// Port every connection attempt targets on the device.
    #[serde(default = "default_device_port")]
    pub device_port: u16,

    /// WebSocket endpoint the relay subscribes to.
    #[serde(default = "default_relay_endpoint")]
    pub relay_endpoint: String,

    /// Channel tag stamped on every relayed message.
    #[serde(default = "default_relay_channel")]
    pub relay_channel: u32,

    /// Channel tag for liveness probes.
    #[serde(default = "default_probe_channel")]
    pub probe_channel: u32,

    /// Bounded setup timeout for dialing the relay source, in seconds.
    #[serde(default = "default_relay_dial_timeout_secs")]
    pub relay_dial_timeout_secs: u64,

    /// Delay before rescanning after a failed or lost connection, in
    /// milliseconds. Zero rescans immediately, which may retarget the same
    /// unreachable device while it remains attached.
    #[serde(default)]
    pub rescan_backoff_ms: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mux_addr: default_mux_addr(),
            device_port: default_device_port(),
            relay_endpoint: default_relay_endpoint(),
            relay_channel: default_relay_channel(),
            probe_channel: default_probe_channel(),
            relay_dial_timeout_secs: default_relay_dial_timeout_secs(),
            rescan_backoff_ms: 0,
            log_settings: LogSettings::default(),
        }
    }
}

fn default_mux_addr() -> String {
    "127.0.0.1:27015".to_string()
}
fn default_device_port() -> u16 {
    29173
}
fn default_relay_endpoint() -> String {
    "ws://49.13.56.241:6969/usbmux/client/subscribe".to_string()
}
fn default_relay_channel() -> u32 {
    106
}
fn default_probe_channel() -> u32 {
    1
}
fn default_relay_dial_timeout_secs() -> u64 {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        match Self::load_from_file(&settings_path) {
            Ok(settings) => Ok(Self {
                settings,
                settings_path,
            }),
            Err(_) => {
                // First run: persist the defaults so there is a file to edit.
                let service = Self {
                    settings: Settings::default(),
                    settings_path,
                };
                let _ = service.save();
                Ok(service)
            }
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("UsbmuxBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}
