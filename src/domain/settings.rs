use crate::infrastructure::bluetooth::protocol::{DisplayMode, DEFAULT_NAME_PREFIX};
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
    #[serde(default = "default_file_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_names: bool,
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
            file_name_prefix: default_file_prefix(),
            show_file_line: default_false(),
            show_thread_names: default_true(),
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
fn default_file_prefix() -> String {
    "pulse_oximeter".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// BLE stack the worker drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    WinRt,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Discovery
    #[serde(default = "default_scan_prefix")]
    pub scan_prefix: String,
    /// The single remembered device; auto-connect targets it
    #[serde(default)]
    pub auto_connect_address: Option<String>,

    // Worker pacing
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default = "default_max_service_scan_retries")]
    pub max_service_scan_retries: u32,
    #[serde(default = "default_false")]
    pub drop_corrupt_frames: bool,

    // Session
    #[serde(default = "default_auth_password")]
    pub auth_password: [u8; 2],
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    #[serde(default = "default_rescan_delay_ms")]
    pub rescan_delay_ms: u64,
    #[serde(default = "default_true")]
    pub request_mac_on_connect: bool,
    #[serde(default)]
    pub display_mode: Option<DisplayMode>,

    #[serde(default)]
    pub transport: TransportKind,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_prefix: default_scan_prefix(),
            auto_connect_address: None,
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            max_service_scan_retries: default_max_service_scan_retries(),
            drop_corrupt_frames: false,
            auth_password: default_auth_password(),
            handshake_delay_ms: default_handshake_delay_ms(),
            rescan_delay_ms: default_rescan_delay_ms(),
            request_mac_on_connect: true,
            display_mode: None,
            transport: TransportKind::default(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }
}

fn default_scan_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}
fn default_inactivity_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_idle_backoff_ms() -> u64 {
    500
}
fn default_max_service_scan_retries() -> u32 {
    3
}
fn default_auth_password() -> [u8; 2] {
    [0x00, 0x00]
}
fn default_handshake_delay_ms() -> u64 {
    2000
}
fn default_rescan_delay_ms() -> u64 {
    3000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load from `path`; a missing or unreadable file yields defaults
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
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
        path.push("PulseOximeter");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
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

    /// Persist `address` as the auto-connect target, replacing any other
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.auto_connect_address.as_deref() != Some(address) {
            self.settings.auto_connect_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }

    pub fn forget_address(&mut self) -> anyhow::Result<()> {
        if self.settings.auto_connect_address.take().is_some() {
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let service = SettingsService::load_from(dir.path().join("settings.json"));

        let s = service.get();
        assert_eq!(s.scan_prefix, "if");
        assert_eq!(s.inactivity_timeout_ms, 5000);
        assert_eq!(s.poll_interval_ms, 50);
        assert_eq!(s.auth_password, [0, 0]);
        assert_eq!(s.auto_connect_address, None);
        assert_eq!(s.transport, TransportKind::WinRt);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "scan_prefix": "oxi", "transport": "simulated", "display_mode": "RmssdSpo2" }"#,
        )
        .unwrap();

        let service = SettingsService::load_from(&path);
        let s = service.get();
        assert_eq!(s.scan_prefix, "oxi");
        assert_eq!(s.transport, TransportKind::Simulated);
        assert_eq!(s.display_mode, Some(DisplayMode::RmssdSpo2));
        assert_eq!(s.max_service_scan_retries, 3);
        assert_eq!(s.log_settings.level, "info");
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::load_from(&path);
        assert_eq!(service.get().scan_prefix, "if");
    }

    #[test]
    fn test_path_reports_settings_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let service = SettingsService::load_from(&path);
        assert_eq!(service.path(), path.as_path());
    }

    #[test]
    fn test_remember_and_forget_address_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::load_from(&path);
        service.remember_address("aa:bb:cc:dd:ee:ff").unwrap();

        let reloaded = SettingsService::load_from(&path);
        assert_eq!(
            reloaded.get().auto_connect_address.as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );

        service.remember_address("11:22:33:44:55:66").unwrap();
        assert_eq!(
            SettingsService::load_from(&path)
                .get()
                .auto_connect_address
                .as_deref(),
            Some("11:22:33:44:55:66")
        );

        service.forget_address().unwrap();
        assert_eq!(SettingsService::load_from(&path).get().auto_connect_address, None);
    }
}
