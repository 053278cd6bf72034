//! Remote file access over SFTP, FTP and FTP tunneled through SSH
//!
//! Every protocol is driven through [`TransferClient`]. A client is created
//! unconnected by [`client_for`], connected once per scheduling pass and
//! closed when the pass ends. All transports are blocking.

pub mod ftp;
pub mod sftp;
pub mod ssh;
pub mod tunnel;

use crate::config::{Connection, Protocol, Settings};
use crate::error::{AppError, AppResult};
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

pub use ftp::FtpClient;
pub use sftp::SftpClient;
pub use tunnel::FtpOverSshClient;

/// Classification of a listed remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks, devices and anything else the engine does not descend into or fetch
    Other,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
    /// Modification time as unix seconds, when the server reports it
    pub modified: Option<i64>,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            kind: EntryKind::File,
            modified: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: EntryKind::Directory,
            modified: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Timeouts applied by every transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Bound on dialing plus handshake/login
    pub connect_timeout: Duration,
    /// Bound on any single blocking read or write once connected
    pub io_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&Settings> for TransferOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            io_timeout: settings.io_timeout(),
        }
    }
}

/// Capability set shared by all protocol clients
pub trait TransferClient: Send {
    /// Dial and authenticate. Failures are reported, never papered over.
    fn connect(&mut self, conn: &Connection) -> AppResult<()>;

    /// List `path`. Entries named `.` and `..` are never returned.
    fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteEntry>>;

    /// Stream the remote file at `path` into `sink`, returning the number of bytes copied.
    fn read_file(&mut self, path: &str, sink: &mut dyn Write) -> AppResult<u64>;

    fn delete(&mut self, path: &str) -> AppResult<()>;

    /// Release every transport handle. Safe to call repeatedly and after failures.
    fn close(&mut self);
}

/// Build an unconnected client for `protocol`
pub fn client_for(protocol: Protocol, options: TransferOptions) -> Box<dyn TransferClient> {
    match protocol {
        Protocol::Sftp => Box::new(SftpClient::new(options)),
        Protocol::Ftp => Box::new(FtpClient::new(options)),
        Protocol::FtpOverSsh => Box::new(FtpOverSshClient::new(options)),
    }
}

/// Resolve `host:port` to the first usable socket address
pub fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Connection(format!("Cannot resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| AppError::Connection(format!("No address found for {}:{}", host, port)))
}

/// Join a remote directory and an entry name with `/` separators
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether a listed name can be mapped onto the local tree
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}
