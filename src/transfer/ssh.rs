//! SSH session setup shared by the SFTP and FTP-over-SSH clients

use super::{resolve, TransferOptions};
use crate::config::Connection;
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use ssh2::Session;
use std::net::TcpStream;
use std::time::Duration;

/// Open an authenticated SSH session to `conn`.
///
/// The private key is used when `sshkeypath` is configured, the password
/// otherwise. Host keys are not verified.
pub fn open_session(conn: &Connection, options: &TransferOptions) -> AppResult<Session> {
    tracing::debug!(
        "Connecting to SSH: host={}, port={}, username={}",
        conn.host,
        conn.port,
        conn.username
    );

    let addr = resolve(&conn.host, conn.port)?;
    let tcp = TcpStream::connect_timeout(&addr, options.connect_timeout)
        .map_err(|e| AppError::Connection(format!("TCP connect to {} failed: {}", addr, e)))?;
    tcp.set_nodelay(true)?;

    let mut session = Session::new()
        .map_err(|e| AppError::Ssh(format!("Failed to create session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_ms(options.connect_timeout));

    session
        .handshake()
        .map_err(|e| AppError::Ssh(format!("SSH handshake failed: {}", sanitize(&e.to_string()))))?;

    authenticate(&session, conn)?;

    // Handshake is done; from here on the bound is per transfer operation
    session.set_timeout(timeout_ms(options.io_timeout));

    tracing::info!(
        "Connected to SSH: {} ({})",
        conn.name,
        session.banner().unwrap_or("no banner")
    );
    Ok(session)
}

fn authenticate(session: &Session, conn: &Connection) -> AppResult<()> {
    if let Some(key_path) = &conn.ssh_key_path {
        tracing::info!("Using SSH key for authentication: {}", key_path.display());
        if !key_path.exists() {
            return Err(AppError::Auth(format!(
                "Private key file not found: {}",
                key_path.display()
            )));
        }
        session
            .userauth_pubkey_file(&conn.username, None, key_path, None)
            .map_err(|e| {
                AppError::Auth(format!("Key auth failed: {}", sanitize(&e.to_string())))
            })?;
    } else {
        tracing::info!("Using password for authentication: {}", conn.username);
        session
            .userauth_password(&conn.username, &conn.password)
            .map_err(|e| {
                AppError::Auth(format!("Password auth failed: {}", sanitize(&e.to_string())))
            })?;
    }

    if !session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }
    Ok(())
}

/// Politely end an SSH session, ignoring failures of an already broken transport
pub fn disconnect(session: &Session) {
    session.set_blocking(true);
    if let Err(e) = session.disconnect(None, "ftransfer closing", None) {
        tracing::debug!("SSH disconnect: {}", e);
    }
}

/// libssh2 timeouts are milliseconds in a u32; 0 would mean "wait forever"
pub(crate) fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}
