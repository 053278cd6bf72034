use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_connections_file")]
    pub connections_file: PathBuf,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// Number of worker groups the connections are split into
    #[serde(default = "default_groups")]
    pub groups: usize,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_reach_timeout")]
    pub reach_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("download")
}

fn default_connections_file() -> PathBuf {
    PathBuf::from("connections.yaml")
}

fn default_database() -> PathBuf {
    PathBuf::from("downloads.db")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("app.log")
}

fn default_groups() -> usize {
    5
}

fn default_cycle_interval() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_io_timeout() -> u64 {
    60
}

fn default_reach_timeout() -> u64 {
    2
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            connections_file: default_connections_file(),
            database: default_database(),
            log_file: default_log_file(),
            groups: default_groups(),
            cycle_interval_secs: default_cycle_interval(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            reach_timeout_secs: default_reach_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> AppResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Settings = toml::from_str(&content)?;
            settings.validate()?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.groups == 0 {
            return Err(AppError::InvalidConfig("groups must be at least 1".to_string()));
        }
        if self.cycle_interval_secs == 0 {
            return Err(AppError::InvalidConfig(
                "cycle_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(AppError::InvalidConfig(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn reach_timeout(&self) -> Duration {
        Duration::from_secs(self.reach_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
