use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from screenlogd.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub monitor: MonitorConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    /// Worker stderr (and with it, tracing output) is appended here after
    /// detachment. If the file cannot be opened the worker logs nowhere.
    pub log_file: PathBuf,
    pub process_name: String,
    pub niceness: i32,
    /// Elevation binary handed the opaque command strings as `-c <command>`.
    pub elevate_command: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub watched_file: PathBuf,
    pub wait_timeout_secs: u64,
    pub refresh_cycles: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

// --- Default implementations ---

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("/run/screenlogd.pid"),
            log_file: PathBuf::from("/var/log/screenlogd.log"),
            process_name: "screenlogd-worker".to_string(),
            niceness: -20,
            elevate_command: "su".to_string(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            watched_file: PathBuf::from("/sys/class/backlight/panel0-backlight/brightness"),
            wait_timeout_secs: crate::monitor::DEFAULT_WAIT_TIMEOUT.as_secs(),
            refresh_cycles: crate::monitor::DEFAULT_REFRESH_CYCLES,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/screenlogd/screen_logger.db"),
        }
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
