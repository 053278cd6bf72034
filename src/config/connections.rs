use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Transfer protocol of a remote server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sftp,
    Ftp,
    /// FTP reached through an SSH port forward
    FtpOverSsh,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Sftp => write!(f, "sftp"),
            Protocol::Ftp => write!(f, "ftp"),
            Protocol::FtpOverSsh => write!(f, "ftpoverssh"),
        }
    }
}

/// One remote server to mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub username: String,
    pub password: String,
    /// Seconds to wait after this connection's pass
    #[serde(default)]
    pub delay: u64,
    /// Remote root directory
    pub path: String,
    /// Directory levels to descend; 0 visits nothing
    #[serde(default)]
    pub depth: u32,
    /// Optional file name filter, empty matches everything
    #[serde(default)]
    pub regex: String,
    /// Private key file; takes precedence over the password for SSH auth
    #[serde(default, rename = "sshkeypath", skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    /// FTP control port on the SSH host's loopback interface (ftpoverssh only)
    #[serde(default = "default_ftp_port", rename = "ftpport")]
    pub ftp_port: u16,
    /// Result of the pre-flight reachability check. Advisory only.
    #[serde(skip)]
    pub reachable: bool,
}

fn default_ftp_port() -> u16 {
    21
}

impl Connection {
    /// `host:port` as used for dialing and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidConfig("connection name is missing".to_string()));
        }
        let missing = |field: &str| {
            AppError::InvalidConfig(format!("{} is missing for {}", field, self.name))
        };
        if self.host.trim().is_empty() {
            return Err(missing("host"));
        }
        if self.port == 0 {
            return Err(AppError::InvalidConfig(format!(
                "invalid port number for {}: {}",
                self.name, self.port
            )));
        }
        if self.username.is_empty() {
            return Err(missing("username"));
        }
        if self.password.is_empty() {
            return Err(missing("password"));
        }
        if self.path.is_empty() {
            return Err(missing("path"));
        }
        if self.protocol == Protocol::FtpOverSsh && self.ftp_port == 0 {
            return Err(AppError::InvalidConfig(format!(
                "invalid ftpport for {}: {}",
                self.name, self.ftp_port
            )));
        }
        if !self.regex.is_empty() {
            regex::Regex::new(&self.regex).map_err(|e| {
                AppError::InvalidConfig(format!("invalid regex for {}: {}", self.name, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Connection {
    /// Minimal valid connection for unit tests
    pub(crate) fn sample(name: &str, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 22,
            protocol,
            username: "user".to_string(),
            password: "pass".to_string(),
            delay: 0,
            path: "/outbox".to_string(),
            depth: 1,
            regex: String::new(),
            ssh_key_path: None,
            ftp_port: default_ftp_port(),
            reachable: false,
        }
    }
}

/// Connections file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsFile {
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl ConnectionsFile {
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("error reading {}: {}", path.display(), e))
        })?;
        let file = Self::parse(&content)?;
        tracing::debug!(
            "Loaded {} connections from {}",
            file.connections.len(),
            path.display()
        );
        Ok(file)
    }

    pub fn parse(content: &str) -> AppResult<Self> {
        let file: ConnectionsFile = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.connections.is_empty() {
            return Err(AppError::InvalidConfig("no connections configured".to_string()));
        }

        let mut names = HashSet::new();
        for conn in &self.connections {
            conn.validate()?;
            if !names.insert(conn.name.as_str()) {
                return Err(AppError::InvalidConfig(format!(
                    "duplicate connection name: {}",
                    conn.name
                )));
            }
        }
        Ok(())
    }
}
