use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
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
    "gatt_scanner".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// What the session does after service discovery reports a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryFailurePolicy {
    /// Close the link and return to `Disconnected`
    #[default]
    Disconnect,
    /// Stay in `DiscoveringServices` until the consumer disconnects
    StayInert,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // GATT Settings
    #[serde(default = "default_target_uuid")]
    pub target_characteristic_uuid: String,
    #[serde(default)]
    pub discovery_failure_policy: DiscoveryFailurePolicy,

    // Scan Settings
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    #[serde(default)]
    pub device_name_filter: Option<String>,
    #[serde(default)]
    pub auto_connect_address: Option<String>,

    // Connection Settings
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    // Event Queue Settings
    /// `None` keeps every event; `Some(n)` drops the oldest entry beyond `n`
    #[serde(default)]
    pub dispatcher_capacity: Option<usize>,

    // Debug Settings
    #[serde(default = "default_false")]
    pub use_simulated_radio: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            target_characteristic_uuid: default_target_uuid(),
            discovery_failure_policy: DiscoveryFailurePolicy::default(),
            scan_duration_ms: default_scan_duration_ms(),
            device_name_filter: None,
            auto_connect_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            dispatcher_capacity: None,
            use_simulated_radio: false,
        }
    }
}

fn default_target_uuid() -> String {
    "12345678-1234-5678-1234-56789abcdef1".to_string()
}
fn default_scan_duration_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
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

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
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
        path.push("GattScanner");
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

    pub fn set_auto_connect_address(&mut self, address: Option<String>) -> anyhow::Result<()> {
        if self.settings.auto_connect_address != address {
            self.settings.auto_connect_address = address;
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "dispatcher_capacity": 16, "discovery_failure_policy": "stay_inert" }"#)
                .unwrap();

        assert_eq!(settings.dispatcher_capacity, Some(16));
        assert_eq!(
            settings.discovery_failure_policy,
            DiscoveryFailurePolicy::StayInert
        );
        assert_eq!(
            settings.target_characteristic_uuid,
            "12345678-1234-5678-1234-56789abcdef1"
        );
        assert_eq!(settings.connect_timeout_ms, 10_000);
        assert_eq!(settings.log_settings, LogSettings::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::with_path(dir.path().join("settings.json"));
        assert_eq!(service.get(), &Settings::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service
            .set_auto_connect_address(Some("AA:BB:CC:DD:EE:FF".to_string()))
            .unwrap();
        service.get_mut().scan_duration_ms = 1200;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(
            reloaded.get().auto_connect_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(reloaded.get().scan_duration_ms, 1200);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::with_path(path);
        assert_eq!(service.get(), &Settings::default());
    }
}
