//! Socket server for the lookup protocol
//!
//! Listens on TCP and/or a Unix socket and serves each connection on its own
//! task. Lookups copy the value into the response buffer while the generation
//! is pinned; the pin is always released before the write is awaited.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::codec::FRAME_HEADER_LEN;
use crate::service::lookup::LookupService;
use crate::service::protocol::{
    encode_response, read_request, write_message, Action, ProtocolError, RequestHeader,
    RESPONSE_HEADER_LEN,
};
use crate::size::MIB;
use crate::status::Status;

/// Default response payload limit
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * MIB;

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP address to listen on
    pub tcp: Option<SocketAddr>,
    /// Unix socket path to listen on
    pub unix: Option<PathBuf>,
    /// Largest response payload served; larger ones become `TooLarge`
    pub max_response_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp: None,
            unix: None,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl ServerConfig {
    /// Listen on `addr`.
    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.tcp = Some(addr);
        self
    }

    /// Listen on the Unix socket at `path`.
    pub fn with_unix(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix = Some(path.into());
        self
    }

    /// Set the response payload limit.
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }
}

/// A running lookup server
///
/// Requires a Tokio runtime.
#[derive(Debug)]
pub struct Server {
    tcp_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Bind the configured listeners and start accepting.
    ///
    /// A TCP port of 0 lets the OS pick one; see [`Server::local_addr`]. A stale
    /// Unix socket file at the configured path is replaced.
    pub async fn bind(config: ServerConfig, service: Arc<LookupService>) -> io::Result<Self> {
        if config.tcp.is_none() && config.unix.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listener configured",
            ));
        }

        let tcp = match config.tcp {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let tcp_addr = match &tcp {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };
        let unix = match &config.unix {
            Some(path) => Some(bind_unix(path)?),
            None => None,
        };

        let max_response_bytes = config.max_response_bytes;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    accepted = accept_tcp(tcp.as_ref()) => match accepted {
                        Ok((socket, peer)) => {
                            let _ = socket.set_nodelay(true);
                            debug!(%peer, "accepted connection");
                            spawn_connection(socket, Arc::clone(&service), max_response_bytes);
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                    accepted = accept_unix(unix.as_ref()) => match accepted {
                        Ok(socket) => {
                            debug!("accepted unix connection");
                            spawn_connection(socket, Arc::clone(&service), max_response_bytes);
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
        });

        info!(
            tcp = ?tcp_addr,
            unix = ?config.unix,
            "lookup server listening"
        );

        Ok(Self {
            tcp_addr,
            unix_path: config.unix,
            shutdown_tx: Some(shutdown_tx),
            join,
        })
    }

    /// Bound TCP address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Bound Unix socket path
    pub fn unix_path(&self) -> Option<&Path> {
        self.unix_path.as_deref()
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Connections already accepted run until their clients disconnect.
    pub async fn shutdown(mut self) -> io::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let joined = (&mut self.join).await;
        if let Some(path) = &self.unix_path {
            remove_socket(path)?;
        }
        joined.map_err(|err| io::Error::other(format!("server join failed: {err}")))
    }
}

#[cfg(unix)]
type UnixAcceptor = UnixListener;
#[cfg(not(unix))]
type UnixAcceptor = std::convert::Infallible;

#[cfg(unix)]
fn bind_unix(path: &Path) -> io::Result<UnixAcceptor> {
    remove_socket(path)?;
    UnixListener::bind(path)
}

#[cfg(not(unix))]
fn bind_unix(_path: &Path) -> io::Result<UnixAcceptor> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not supported on this platform",
    ))
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn accept_unix(listener: Option<&UnixAcceptor>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(socket, _)| socket),
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn accept_unix(listener: Option<&UnixAcceptor>) -> io::Result<TcpStream> {
    match listener {
        Some(never) => match *never {},
        None => std::future::pending().await,
    }
}

fn spawn_connection<S>(socket: S, service: Arc<LookupService>, max_response_bytes: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        service.metrics().record_connection_open();
        if let Err(err) = serve_connection(socket, &service, max_response_bytes).await {
            debug!(error = %err, "connection closed with error");
        }
        service.metrics().record_connection_close();
    });
}

/// Serve requests on one connection until the client quits or disconnects.
pub async fn serve_connection<S>(
    socket: S,
    service: &LookupService,
    max_response_bytes: usize,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(socket);
    let mut key = Vec::new();
    let mut out = Vec::new();

    loop {
        out.clear();
        match read_request(&mut stream, &mut key).await {
            Ok(Some(header)) => {
                if !respond(service, &header, &key, max_response_bytes, &mut out)? {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(err) if err.is_recoverable() => {
                service.metrics().record_bad_request();
                empty_response(&mut out, Status::BadRequest);
            }
            Err(err @ (ProtocolError::BadVersion(_) | ProtocolError::KeyTooLong(_))) => {
                // The stream can no longer be parsed; answer once and hang up.
                service.metrics().record_bad_request();
                empty_response(&mut out, Status::BadRequest);
                write_message(&mut stream, &out).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        }
        write_message(&mut stream, &out).await?;
        service.metrics().record_bytes_sent(out.len());
    }
}

/// Build the response to one request in `out`. Returns false on quit.
fn respond(
    service: &LookupService,
    header: &RequestHeader,
    key: &[u8],
    max_response_bytes: usize,
    out: &mut Vec<u8>,
) -> Result<bool, ProtocolError> {
    match header.action()? {
        Action::Quit => return Ok(false),
        Action::Fetch => {
            out.push(Status::Ok.as_u8());
            let status = service.get_into(header.table, header.index, key, out);
            let payload_len = out.len().saturating_sub(RESPONSE_HEADER_LEN);
            if status != Status::Ok {
                empty_response(out, status);
            } else if payload_len > max_response_bytes {
                too_large(service, out, payload_len);
            }
        }
        Action::Stats => {
            service.metrics().record_admin();
            match service.stats(header.table) {
                Some(stats) => json_response(service, &stats, max_response_bytes, out)?,
                None => empty_response(out, Status::UnknownTable),
            }
        }
        Action::Describe => {
            service.metrics().record_admin();
            json_response(service, &service.describe(), max_response_bytes, out)?;
        }
    }
    Ok(true)
}

fn json_response<T: Serialize>(
    service: &LookupService,
    value: &T,
    max_response_bytes: usize,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > max_response_bytes {
        too_large(service, out, payload.len());
        return Ok(());
    }
    encode_response(out, Status::Ok, &payload)
}

fn too_large(service: &LookupService, out: &mut Vec<u8>, len: usize) {
    debug!(len, "response exceeds size limit");
    service.metrics().record_too_large();
    empty_response(out, Status::TooLarge);
}

fn empty_response(out: &mut Vec<u8>, status: Status) {
    out.clear();
    out.push(status.as_u8());
    out.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
}
