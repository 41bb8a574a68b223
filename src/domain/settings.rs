use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
    #[serde(default = "default_true")]
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
            show_thread_ids: default_true(),
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
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bt_host_core".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// How the host reaches the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    LocalSocket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16, // root-canal HCI port
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            host: default_host(),
            port: default_port(),
            socket_name: default_socket_name(),
        }
    }
}

fn default_transport_kind() -> TransportKind {
    TransportKind::Tcp
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6402
}
fn default_socket_name() -> String {
    "/tmp/bt_host_core_hci.sock".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnoopMode {
    Disabled,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoopSettings {
    #[serde(default = "default_snoop_mode")]
    pub mode: SnoopMode,
    #[serde(default = "default_snoop_path")]
    pub path: String,
}

impl Default for SnoopSettings {
    fn default() -> Self {
        Self {
            mode: default_snoop_mode(),
            path: default_snoop_path(),
        }
    }
}

fn default_snoop_mode() -> SnoopMode {
    SnoopMode::Disabled
}
fn default_snoop_path() -> String {
    "logs/btsnoop_hci.log".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub snoop: SnoopSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Stack timeouts
    #[serde(default = "default_stack_start_timeout_ms")]
    pub stack_start_timeout_ms: u64,
    #[serde(default = "default_stack_stop_timeout_ms")]
    pub stack_stop_timeout_ms: u64,
    #[serde(default = "default_module_stop_timeout_ms")]
    pub module_stop_timeout_ms: u64,

    #[serde(default = "default_data_queue_capacity")]
    pub data_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            snoop: SnoopSettings::default(),
            log_settings: LogSettings::default(),
            stack_start_timeout_ms: default_stack_start_timeout_ms(),
            stack_stop_timeout_ms: default_stack_stop_timeout_ms(),
            module_stop_timeout_ms: default_module_stop_timeout_ms(),
            data_queue_capacity: default_data_queue_capacity(),
        }
    }
}

fn default_stack_start_timeout_ms() -> u64 {
    3000
}
fn default_stack_stop_timeout_ms() -> u64 {
    5000
}
fn default_module_stop_timeout_ms() -> u64 {
    20
}
fn default_data_queue_capacity() -> usize {
    16
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

    /// Load from `path`, falling back to defaults when it is missing or
    /// unreadable.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BluetoothHostCore");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::from_path(dir.path().join("absent.json"));
        let settings = service.get();
        assert_eq!(settings.transport.kind, TransportKind::Tcp);
        assert_eq!(settings.transport.port, 6402);
        assert_eq!(settings.snoop.mode, SnoopMode::Disabled);
        assert_eq!(settings.stack_start_timeout_ms, 3000);
        assert_eq!(settings.module_stop_timeout_ms, 20);
        assert_eq!(settings.log_settings.file_name_prefix, "bt_host_core");
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "transport": { "kind": "local_socket", "socket_name": "hci" }, "data_queue_capacity": 4 }"#,
        )
        .unwrap();

        let service = SettingsService::from_path(&path);
        let settings = service.get();
        assert_eq!(settings.transport.kind, TransportKind::LocalSocket);
        assert_eq!(settings.transport.socket_name, "hci");
        assert_eq!(settings.transport.host, "127.0.0.1");
        assert_eq!(settings.data_queue_capacity, 4);
        assert_eq!(settings.stack_stop_timeout_ms, 5000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::from_path(&path);
        service.get_mut().snoop.mode = SnoopMode::Full;
        service.get_mut().transport.port = 7000;
        service.save().unwrap();

        let reloaded = SettingsService::from_path(&path);
        assert_eq!(reloaded.get().snoop.mode, SnoopMode::Full);
        assert_eq!(reloaded.get().transport.port, 7000);
        assert_eq!(reloaded.path(), path.as_path());
    }

    #[test]
    fn test_garbage_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        let service = SettingsService::from_path(&path);
        assert_eq!(service.get().transport.port, 6402);
    }
}
