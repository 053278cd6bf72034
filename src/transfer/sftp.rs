//! SFTP client

use super::{is_plain_name, ssh, EntryKind, RemoteEntry, TransferClient, TransferOptions};
use crate::config::Connection;
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use ssh2::{FileStat, Session as Ssh2Session, Sftp};
use std::io::{self, Write};
use std::path::Path;

/// An active SFTP connection
struct SftpSession {
    sftp: Sftp,
    session: Ssh2Session,
}

/// SFTP client; authenticates with the configured key or password
pub struct SftpClient {
    options: TransferOptions,
    active: Option<SftpSession>,
}

impl SftpClient {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            options,
            active: None,
        }
    }

    fn active(&self) -> AppResult<&SftpSession> {
        self.active
            .as_ref()
            .ok_or_else(|| AppError::Connection("SFTP client is not connected".to_string()))
    }
}

impl TransferClient for SftpClient {
    fn connect(&mut self, conn: &Connection) -> AppResult<()> {
        self.close();

        let session = ssh::open_session(conn, &self.options)?;
        let sftp = match session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => {
                ssh::disconnect(&session);
                return Err(AppError::Ssh(format!("Failed to open SFTP: {}", e)));
            }
        };

        tracing::debug!("Connected to SFTP: {}", conn.name);
        self.active = Some(SftpSession { sftp, session });
        Ok(())
    }

    fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteEntry>> {
        let active = self.active()?;
        let entries = active
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| AppError::Listing {
                path: path.to_string(),
                message: sanitize(&e.to_string()),
            })?;

        let mut result = Vec::with_capacity(entries.len());
        for (file_path, stat) in entries {
            let name = file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if !is_plain_name(&name) {
                continue;
            }

            result.push(RemoteEntry {
                kind: classify(&stat),
                size: stat.size.unwrap_or(0),
                modified: stat.mtime.map(|t| t as i64),
                name,
            });
        }

        Ok(result)
    }

    fn read_file(&mut self, path: &str, sink: &mut dyn Write) -> AppResult<u64> {
        let active = self.active()?;
        let mut file = active
            .sftp
            .open(Path::new(path))
            .map_err(|e| AppError::Transfer(format!("Failed to open {}: {}", path, e)))?;

        io::copy(&mut file, sink)
            .map_err(|e| AppError::Transfer(format!("Failed to read {}: {}", path, e)))
    }

    fn delete(&mut self, path: &str) -> AppResult<()> {
        let active = self.active()?;
        active
            .sftp
            .unlink(Path::new(path))
            .map_err(|e| AppError::Transfer(format!("Failed to delete {}: {}", path, e)))
    }

    fn close(&mut self) {
        if let Some(SftpSession { sftp, session }) = self.active.take() {
            // The subsystem channel has to go before the session it runs on
            drop(sftp);
            ssh::disconnect(&session);
        }
    }
}

impl Drop for SftpClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify(stat: &FileStat) -> EntryKind {
    if stat.is_dir() {
        EntryKind::Directory
    } else if stat.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}
