//! Plain FTP client and the FTP operations shared with the SSH tunnel variant

use super::{is_plain_name, resolve, EntryKind, RemoteEntry, TransferClient, TransferOptions};
use crate::config::Connection;
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use suppaftp::list::File as ListedFile;
use suppaftp::{FtpError, FtpStream};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};

/// Plain FTP client. Its listing only ever returns regular files.
pub struct FtpClient {
    options: TransferOptions,
    stream: Option<FtpStream>,
}

impl FtpClient {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            options,
            stream: None,
        }
    }

    fn stream(&mut self) -> AppResult<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| AppError::Connection("FTP client is not connected".to_string()))
    }
}

impl TransferClient for FtpClient {
    fn connect(&mut self, conn: &Connection) -> AppResult<()> {
        self.close();

        tracing::debug!(
            "Connecting to FTP: host={}, port={}, username={}",
            conn.host,
            conn.port,
            conn.username
        );
        let addr = resolve(&conn.host, conn.port)?;
        let options = self.options;
        let mut stream = FtpStream::connect_timeout(addr, self.options.connect_timeout)
            .map_err(|e| AppError::Connection(format!("Failed to dial FTP {}: {}", addr, e)))?
            .passive_stream_builder(move |addr| {
                open_data_stream(addr, &options).map_err(FtpError::ConnectionError)
            });
        stream.get_ref().set_read_timeout(Some(self.options.io_timeout))?;
        stream.get_ref().set_write_timeout(Some(self.options.io_timeout))?;

        login(&mut stream, conn)?;

        tracing::debug!("Connected to FTP: {}", conn.name);
        self.stream = Some(stream);
        Ok(())
    }

    fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteEntry>> {
        let entries = list(self.stream()?, path)?;
        Ok(entries.into_iter().filter(RemoteEntry::is_file).collect())
    }

    fn read_file(&mut self, path: &str, sink: &mut dyn Write) -> AppResult<u64> {
        retrieve(self.stream()?, path, sink)
    }

    fn delete(&mut self, path: &str) -> AppResult<()> {
        remove(self.stream()?, path)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            quit(stream);
        }
    }
}

impl Drop for FtpClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial a passive data connection with the same deadlines as the control connection
pub(super) fn open_data_stream(
    addr: SocketAddr,
    options: &TransferOptions,
) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, options.connect_timeout)?;
    stream.set_read_timeout(Some(options.io_timeout))?;
    stream.set_write_timeout(Some(options.io_timeout))?;
    Ok(stream)
}

/// Log in on a freshly dialed control connection, quitting it on failure
pub(super) fn login(stream: &mut FtpStream, conn: &Connection) -> AppResult<()> {
    if let Err(e) = stream.login(&conn.username, &conn.password) {
        let _ = stream.quit();
        return Err(AppError::Auth(format!(
            "Failed to login to FTP: {}",
            sanitize(&e.to_string())
        )));
    }
    Ok(())
}

/// LIST `path` and classify every parseable line
pub(super) fn list(stream: &mut FtpStream, path: &str) -> AppResult<Vec<RemoteEntry>> {
    let lines = stream.list(Some(path)).map_err(|e| AppError::Listing {
        path: path.to_string(),
        message: sanitize(&e.to_string()),
    })?;
    Ok(parse_listing(&lines))
}

pub(super) fn parse_listing(lines: &[String]) -> Vec<RemoteEntry> {
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        let file = match line.parse::<ListedFile>() {
            Ok(file) => file,
            Err(_) => {
                tracing::debug!("Skipping unparseable listing line: {}", line);
                continue;
            }
        };

        if !is_plain_name(file.name()) {
            continue;
        }

        let kind = if file.is_directory() {
            EntryKind::Directory
        } else if file.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        entries.push(RemoteEntry {
            name: file.name().to_string(),
            size: file.size() as u64,
            kind,
            modified: None,
        });
    }
    entries
}

/// RETR `path` into `sink`; the data connection is finalized before returning
pub(super) fn retrieve(
    stream: &mut FtpStream,
    path: &str,
    sink: &mut dyn Write,
) -> AppResult<u64> {
    stream
        .retr(path, |reader| {
            io::copy(reader, &mut *sink).map_err(FtpError::ConnectionError)
        })
        .map_err(|e| AppError::Transfer(format!("Failed to retrieve {}: {}", path, e)))
}

pub(super) fn remove(stream: &mut FtpStream, path: &str) -> AppResult<()> {
    stream
        .rm(path)
        .map_err(|e| AppError::Transfer(format!("Failed to delete {}: {}", path, e)))
}

pub(super) fn quit(mut stream: FtpStream) {
    if let Err(e) = stream.quit() {
        tracing::debug!("FTP quit: {}", e);
    }
}
