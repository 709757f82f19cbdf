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
    "ble_command_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: String,
    /// Space separated device names accepted while scanning; blank accepts all
    #[serde(default = "default_name_filter")]
    pub device_name_filter: String,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    #[serde(default = "default_max_reply_rounds")]
    pub max_reply_rounds: usize,

    // Known devices
    #[serde(default)]
    pub known_device_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_command_char_uuid: default_command_uuid(),
            device_name_filter: default_name_filter(),
            operation_timeout_ms: default_operation_timeout_ms(),
            scan_duration_ms: default_scan_duration_ms(),
            max_reply_rounds: default_max_reply_rounds(),
            known_device_addresses: Vec::new(),
            last_connected_address: None,
        }
    }
}

fn default_command_uuid() -> String {
    "0000fe41-8e22-4541-9d4c-21edae82ed19".to_string()
}
fn default_name_filter() -> String {
    "MyESP32".to_string()
}
fn default_operation_timeout_ms() -> u64 {
    2000
}
fn default_scan_duration_ms() -> u64 {
    10_000
}
fn default_max_reply_rounds() -> usize {
    256
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
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
        path.push("BleCommandBridge");
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

    /// Remember a device that was connected successfully
    pub fn add_known_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self
            .settings
            .known_device_addresses
            .iter()
            .any(|known| known == address)
        {
            self.settings.known_device_addresses.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "device_name_filter": "Gate Pump" }"#).unwrap();
        assert_eq!(settings.device_name_filter, "Gate Pump");
        assert_eq!(settings.operation_timeout_ms, 2000);
        assert_eq!(settings.scan_duration_ms, 10_000);
        assert_eq!(
            settings.ble_command_char_uuid,
            "0000fe41-8e22-4541-9d4c-21edae82ed19"
        );
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let service = SettingsService::with_path(&path);
        assert_eq!(service.get().device_name_filter, "MyESP32");
        assert_eq!(service.get().max_reply_rounds, 256);
    }

    #[test]
    fn test_known_addresses_are_saved_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(&path);
        service.add_known_address("24:0A:C4:00:00:01").unwrap();
        service.add_known_address("24:0A:C4:00:00:01").unwrap();

        let reloaded = SettingsService::with_path(&path);
        assert_eq!(
            reloaded.get().known_device_addresses,
            vec!["24:0A:C4:00:00:01".to_string()]
        );
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("24:0A:C4:00:00:01")
        );
    }
}
