use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::default_data_dir;
use crate::validation::is_route_safe;

/// Settings file name inside the data directory.
pub const SETTINGS_FILE_NAME: &str = "codedock.toml";

/// Load settings from `path`, writing the defaults there when the file does not exist yet.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        save_settings(path, &settings)?;
        log::info!("Wrote default settings to {}", path.display());
        return Ok(settings);
    }
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    let settings: Settings =
        toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(settings).map_err(|e| AppError::config(e.to_string()))?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

/// Default location of the settings file.
pub fn default_settings_path() -> PathBuf {
    default_data_dir().join(SETTINGS_FILE_NAME)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub ports: PortSettings,
    #[serde(default)]
    pub editor: EditorSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            ports: PortSettings::default(),
            editor: EditorSettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.ports.capacity == 0 {
            return Err(AppError::config("ports.capacity must be at least 1"));
        }
        let last = u32::from(self.ports.start) + self.ports.capacity as u32 - 1;
        if self.ports.start == 0 || last > u32::from(u16::MAX) {
            return Err(AppError::config(format!(
                "port range {}..={} is not a valid TCP range",
                self.ports.start, last
            )));
        }
        if !is_route_safe(&self.proxy.namespace) {
            return Err(AppError::config(format!(
                "proxy.namespace '{}' may only contain [a-z0-9-_]",
                self.proxy.namespace
            )));
        }
        if self.proxy.test_command.is_empty() || self.proxy.reload_command.is_empty() {
            return Err(AppError::config(
                "proxy.test_command and proxy.reload_command must not be empty",
            ));
        }
        if self.editor.binary.trim().is_empty() {
            return Err(AppError::config("editor.binary must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorSettings {
    #[serde(default = "default_editor_binary")]
    pub binary: String,
    /// Substring identifying editor-server processes in the OS process table.
    #[serde(default = "default_editor_binary")]
    pub signature: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            binary: default_editor_binary(),
            signature: default_editor_binary(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl EditorSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_include_dir")]
    pub include_dir: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            include_dir: default_include_dir(),
            namespace: default_namespace(),
            upstream_host: default_upstream_host(),
            test_command: default_test_command(),
            reload_command: default_reload_command(),
            reload_timeout_secs: default_reload_timeout_secs(),
        }
    }
}

impl ProxySettings {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs.max(1))
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8420))
}

fn default_port_start() -> u16 {
    9000
}

fn default_capacity() -> usize {
    12
}

fn default_editor_binary() -> String {
    "code-server".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_include_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/codedock.d")
}

fn default_namespace() -> String {
    "code".to_string()
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_test_command() -> Vec<String> {
    vec!["nginx".to_string(), "-t".to_string()]
}

fn default_reload_command() -> Vec<String> {
    vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()]
}

fn default_reload_timeout_secs() -> u64 {
    10
}
