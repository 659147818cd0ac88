use crate::infrastructure::bluetooth::protocol::MIN_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    /// Level for this crate's own events, on top of `level`.
    #[serde(default = "default_link_level")]
    pub link_level: String,
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
            link_level: default_link_level(),
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
fn default_link_level() -> String {
    "debug".to_string()
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
    "hover_robot_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Tunables of the BLE link. Wire identifiers are not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    /// Shortest notification accepted as a telemetry frame.
    #[serde(default = "default_min_frame_len")]
    pub min_frame_len: usize,
    #[serde(default = "default_stream_capacity")]
    pub status_capacity: usize,
    #[serde(default = "default_stream_capacity")]
    pub snapshot_capacity: usize,
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,
    /// Settings commands allowed to wait behind an outstanding write.
    #[serde(default = "default_max_pending")]
    pub max_pending_must_deliver: usize,

    // Used by the command line runner only
    #[serde(default = "default_device_name")]
    pub target_device_name: String,
    #[serde(default = "default_true")]
    pub connect_after_scan: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            scan_window_ms: default_scan_window_ms(),
            min_frame_len: default_min_frame_len(),
            status_capacity: default_stream_capacity(),
            snapshot_capacity: default_stream_capacity(),
            telemetry_capacity: default_telemetry_capacity(),
            max_pending_must_deliver: default_max_pending(),
            target_device_name: default_device_name(),
            connect_after_scan: default_true(),
        }
    }
}

fn default_scan_window_ms() -> u64 {
    10_000
}
fn default_min_frame_len() -> usize {
    MIN_FRAME_LEN
}
fn default_stream_capacity() -> usize {
    64
}
fn default_telemetry_capacity() -> usize {
    256
}
fn default_max_pending() -> usize {
    16
}
fn default_device_name() -> String {
    "HoverRobot".to_string()
}

/// Runtime configuration handed to the Bluetooth service.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub scan_window: Duration,
    pub min_frame_len: usize,
    pub status_capacity: usize,
    pub snapshot_capacity: usize,
    pub telemetry_capacity: usize,
    pub max_pending_must_deliver: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for LinkConfig {
    fn from(s: &LinkSettings) -> Self {
        // Zero capacities would make tokio's broadcast channel panic
        Self {
            scan_window: Duration::from_millis(s.scan_window_ms),
            min_frame_len: s.min_frame_len,
            status_capacity: s.status_capacity.max(1),
            snapshot_capacity: s.snapshot_capacity.max(1),
            telemetry_capacity: s.telemetry_capacity.max(1),
            max_pending_must_deliver: s.max_pending_must_deliver.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HoverRobotLink");
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig::from(&self.settings.link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "link": { "scan_window_ms": 2500 } }"#).unwrap();

        let service = SettingsService::from_path(path);
        let link = &service.get().link;
        assert_eq!(link.scan_window_ms, 2500);
        assert_eq!(link.min_frame_len, 16);
        assert_eq!(service.get().log_settings.level, "info");
        assert_eq!(service.get().log_settings.link_level, "debug");
        assert_eq!(service.link_config().scan_window, Duration::from_millis(2500));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().link.target_device_name = "Robotito".to_string();
        service.get_mut().link.telemetry_capacity = 0;
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path);
        assert_eq!(reloaded.get().link.target_device_name, "Robotito");
        assert_eq!(reloaded.link_config().telemetry_capacity, 1);
    }

    #[test]
    fn test_garbage_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let service = SettingsService::from_path(path);
        assert_eq!(service.get().link.scan_window_ms, 10_000);
    }
}
