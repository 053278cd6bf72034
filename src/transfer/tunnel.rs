//! FTP tunneled through an SSH port forward
//!
//! suppaftp only speaks over `TcpStream`s, so every stream that has to cross
//! the tunnel (the control connection and each passive data connection) is
//! a loopback socket pair whose far end is pumped through an SSH
//! `direct-tcpip` channel. One forwarding thread owns the SSH session and runs
//! it non-blocking, multiplexing all channels.

use super::{ftp, ssh, RemoteEntry, TransferClient, TransferOptions};
use crate::config::Connection;
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use ssh2::{Channel, Session as Ssh2Session};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use suppaftp::{FtpError, FtpStream};

/// Where the FTP server listens, as seen from the SSH host
const TUNNEL_FTP_HOST: &str = "127.0.0.1";

const PUMP_CHUNK: usize = 32 * 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// FTP client whose control and data connections all run through SSH
pub struct FtpOverSshClient {
    options: TransferOptions,
    active: Option<TunnelSession>,
}

struct TunnelSession {
    ftp: FtpStream,
    forwarder: Forwarder,
}

impl FtpOverSshClient {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            options,
            active: None,
        }
    }

    fn ftp(&mut self) -> AppResult<&mut FtpStream> {
        self.active
            .as_mut()
            .map(|active| &mut active.ftp)
            .ok_or_else(|| {
                AppError::Connection("FTP over SSH client is not connected".to_string())
            })
    }
}

impl TransferClient for FtpOverSshClient {
    fn connect(&mut self, conn: &Connection) -> AppResult<()> {
        self.close();

        let session = ssh::open_session(conn, &self.options)?;
        // From here on dropping `forwarder` stops the thread and disconnects SSH
        let forwarder = Forwarder::spawn(session, &conn.name, self.options.io_timeout)?;

        tracing::debug!(
            "Dialing FTP over SSH: {}:{} via {}",
            TUNNEL_FTP_HOST,
            conn.ftp_port,
            conn.address()
        );
        let control = forwarder
            .opener()
            .open(TUNNEL_FTP_HOST, conn.ftp_port)
            .map_err(|e| AppError::Connection(format!("Failed to dial FTP over SSH: {}", e)))?;

        let opener = forwarder.opener();
        let mut stream = FtpStream::connect_with_stream(control)
            .map_err(|e| AppError::Connection(format!("FTP over SSH greeting failed: {}", e)))?
            .passive_stream_builder(move |addr| {
                opener
                    .open(&addr.ip().to_string(), addr.port())
                    .map_err(FtpError::ConnectionError)
            });

        ftp::login(&mut stream, conn)?;

        tracing::debug!("Connected to FTP over SSH: {}", conn.name);
        self.active = Some(TunnelSession {
            ftp: stream,
            forwarder,
        });
        Ok(())
    }

    fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteEntry>> {
        let entries = ftp::list(self.ftp()?, path)?;
        for entry in entries.iter().filter(|e| !e.is_file() && !e.is_dir()) {
            tracing::debug!("Other filetype: {}, Size: {}", entry.name, entry.size);
        }
        Ok(entries)
    }

    fn read_file(&mut self, path: &str, sink: &mut dyn Write) -> AppResult<u64> {
        ftp::retrieve(self.ftp()?, path, sink)
    }

    fn delete(&mut self, path: &str) -> AppResult<()> {
        ftp::remove(self.ftp()?, path)
    }

    fn close(&mut self) {
        if let Some(TunnelSession { ftp: stream, mut forwarder }) = self.active.take() {
            ftp::quit(stream);
            forwarder.stop();
        }
    }
}

impl Drop for FtpOverSshClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct OpenRequest {
    host: String,
    port: u16,
    reply: mpsc::Sender<io::Result<TcpStream>>,
}

/// Asks the forwarding thread for a new tunneled stream
#[derive(Clone)]
struct TunnelOpener {
    requests: Arc<Mutex<mpsc::Sender<OpenRequest>>>,
    /// Read and write deadline set on every stream handed out
    io_timeout: Duration,
}

impl TunnelOpener {
    fn open(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "SSH tunnel is closed");

        let (reply, response) = mpsc::channel();
        self.requests
            .lock()
            .send(OpenRequest {
                host: host.to_string(),
                port,
                reply,
            })
            .map_err(|_| closed())?;
        let stream = response.recv().map_err(|_| closed())??;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        Ok(stream)
    }
}

/// Owner of the forwarding thread
struct Forwarder {
    opener: TunnelOpener,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Forwarder {
    fn spawn(session: Ssh2Session, label: &str, io_timeout: Duration) -> AppResult<Self> {
        let (requests, incoming) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();

        let handle = thread::Builder::new()
            .name(format!("tunnel-{}", label))
            .spawn(move || forward_loop(session, incoming, stop))?;

        Ok(Self {
            opener: TunnelOpener {
                requests: Arc::new(Mutex::new(requests)),
                io_timeout,
            },
            shutdown,
            handle: Some(handle),
        })
    }

    fn opener(&self) -> TunnelOpener {
        self.opener.clone()
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("SSH tunnel thread panicked");
            }
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_loop(
    session: Ssh2Session,
    incoming: mpsc::Receiver<OpenRequest>,
    shutdown: Arc<AtomicBool>,
) {
    session.set_blocking(false);
    let mut links: Vec<Link<Channel>> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        while let Ok(request) = incoming.try_recv() {
            let result = open_link(&session, &request.host, request.port).map(|(link, stream)| {
                links.push(link);
                stream
            });
            if let Err(e) = &result {
                tracing::debug!(
                    "Tunnel to {}:{} failed: {}",
                    request.host,
                    request.port,
                    e
                );
            }
            let _ = request.reply.send(result);
        }

        let mut busy = false;
        links.retain_mut(|link| match link.pump() {
            LinkState::Busy => {
                busy = true;
                true
            }
            LinkState::Idle => true,
            LinkState::Closed => false,
        });

        if !busy {
            thread::sleep(IDLE_SLEEP);
        }
    }

    drop(links);
    ssh::disconnect(&session);
    tracing::debug!("SSH tunnel closed");
}

fn open_link(
    session: &Ssh2Session,
    host: &str,
    port: u16,
) -> io::Result<(Link<Channel>, TcpStream)> {
    // Channel setup is a multi-step exchange; do it blocking like keepalives
    session.set_blocking(true);
    let channel = session.channel_direct_tcpip(host, port, None);
    session.set_blocking(false);
    let channel = channel
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

    let (local, caller) = socket_pair()?;
    Ok((Link::new(local, channel), caller))
}

/// Connected loopback pair: (pump side, caller side)
fn socket_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let caller = TcpStream::connect(listener.local_addr()?)?;
    let (local, peer) = listener.accept()?;
    if peer != caller.local_addr()? {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "unexpected peer on tunnel socket",
        ));
    }
    local.set_nonblocking(true)?;
    local.set_nodelay(true)?;
    Ok((local, caller))
}

/// Remote end of a forwarded stream
trait TunnelChannel: Read + Write {
    fn remote_eof(&self) -> bool;
    fn close_write(&mut self);
}

impl TunnelChannel for Channel {
    fn remote_eof(&self) -> bool {
        self.eof()
    }

    fn close_write(&mut self) {
        let _ = self.send_eof();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Busy,
    Idle,
    Closed,
}

/// One forwarded stream: a non-blocking loopback socket paired with a channel
struct Link<C> {
    local: TcpStream,
    channel: C,
    to_remote: Vec<u8>,
    to_local: Vec<u8>,
    local_eof: bool,
    remote_eof: bool,
}

impl<C: TunnelChannel> Link<C> {
    fn new(local: TcpStream, channel: C) -> Self {
        Self {
            local,
            channel,
            to_remote: Vec::new(),
            to_local: Vec::new(),
            local_eof: false,
            remote_eof: false,
        }
    }

    fn pump(&mut self) -> LinkState {
        match self.transfer() {
            Ok(_) if self.remote_eof && self.to_local.is_empty() => LinkState::Closed,
            Ok(true) => LinkState::Busy,
            Ok(false) => LinkState::Idle,
            Err(e) => {
                tracing::debug!("Tunnel stream closed: {}", e);
                LinkState::Closed
            }
        }
    }

    /// Move whatever is ready in both directions; true if any byte moved
    fn transfer(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; PUMP_CHUNK];
        let mut moved = false;

        if self.to_remote.is_empty() && !self.local_eof {
            match self.local.read(&mut buf) {
                Ok(0) => {
                    self.local_eof = true;
                    self.channel.close_write();
                    moved = true;
                }
                Ok(n) => {
                    self.to_remote.extend_from_slice(&buf[..n]);
                    moved = true;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.to_remote.is_empty() {
            match self.channel.write(&self.to_remote) {
                Ok(n) => {
                    self.to_remote.drain(..n);
                    moved |= n > 0;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if self.to_local.is_empty() && !self.remote_eof {
            match self.channel.read(&mut buf) {
                Ok(0) => {
                    if self.channel.remote_eof() {
                        self.remote_eof = true;
                        moved = true;
                    }
                }
                Ok(n) => {
                    self.to_local.extend_from_slice(&buf[..n]);
                    moved = true;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.to_local.is_empty() {
            match self.local.write(&self.to_local) {
                Ok(n) => {
                    self.to_local.drain(..n);
                    moved |= n > 0;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(moved)
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
