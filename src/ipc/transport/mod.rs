//! Byte-stream transport abstraction.
//!
//! The IPC core never touches sockets directly. A [`Listener`] accepts
//! [`Connection`]s; a connection exposes readiness futures plus
//! non-blocking `try_read`/`try_write` that report [`IoStatus::WouldBlock`]
//! instead of failing, so each client actor drives its own cooperative
//! event loop.
//!
//! Concrete transports:
//! - [`unix`] - Unix domain sockets (`unix:///path` or a bare path)
//! - [`tcp`] - TCP sockets (`tcp://host:port` or a bare `host:port`)

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;

use super::error::{IpcError, Result};

pub mod tcp;
pub mod unix;

/// Outcome of a non-blocking read or write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// `n` bytes were transferred.
    Ready(usize),
    /// Nothing can be transferred right now; wait for readiness.
    WouldBlock,
    /// The peer closed the connection (orderly or abruptly).
    Disconnected,
}

/// One accepted, bidirectional byte stream.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Wait until the stream may be readable. May wake spuriously.
    async fn readable(&self) -> io::Result<()>;

    /// Wait until the stream may be writable. May wake spuriously.
    async fn writable(&self) -> io::Result<()>;

    /// Read without blocking.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<IoStatus>;

    /// Write without blocking.
    fn try_write(&self, buf: &[u8]) -> io::Result<IoStatus>;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;

    /// Close the stream.
    fn close(self: Box<Self>);
}

/// A bound, listening endpoint.
#[async_trait]
pub trait Listener: Send + Sync + fmt::Debug {
    /// Wait for and accept the next connection.
    async fn accept(&self) -> io::Result<Box<dyn Connection>>;

    /// Endpoint this listener is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Release the endpoint so it can be bound again once this returns
    /// (close the TCP socket, remove the Unix socket file).
    ///
    /// Idempotent. Pending and later [`accept`](Self::accept) calls fail.
    fn close(&self);
}

/// A listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at a filesystem path.
    Unix(PathBuf),
    /// TCP socket at `host:port`.
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(IpcError::Endpoint(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return parse_host_port(addr).map(Self::Tcp);
        }
        if s.contains("://") || s.is_empty() {
            return Err(IpcError::Endpoint(s.to_string()));
        }
        if s.contains('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        parse_host_port(s).map(Self::Tcp)
    }
}

fn parse_host_port(addr: &str) -> Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| IpcError::Endpoint(addr.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(IpcError::Endpoint(addr.to_string()));
    }
    Ok(addr.to_string())
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Split a `;`-separated endpoint list.
///
/// Whitespace around entries is trimmed and empty entries are skipped.
/// Parsing stops at the first invalid descriptor.
pub fn parse_endpoints(spec: &str) -> Result<Vec<Endpoint>> {
    spec.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// Bind a listener for `endpoint`.
///
/// Must be called from within a tokio runtime.
pub fn listen(endpoint: &Endpoint) -> Result<Box<dyn Listener>> {
    let bind_err = |source| IpcError::Bind {
        endpoint: endpoint.to_string(),
        source,
    };
    match endpoint {
        Endpoint::Unix(path) => Ok(Box::new(unix::UnixTransportListener::bind(path).map_err(bind_err)?)),
        Endpoint::Tcp(addr) => Ok(Box::new(tcp::TcpTransportListener::bind(addr).map_err(bind_err)?)),
    }
}

/// Map a raw non-blocking read result onto [`IoStatus`].
pub(crate) fn read_status(res: io::Result<usize>) -> io::Result<IoStatus> {
    match res {
        Ok(0) => Ok(IoStatus::Disconnected),
        Ok(n) => Ok(IoStatus::Ready(n)),
        Err(e) => classify_error(e),
    }
}

/// Map a raw non-blocking write result onto [`IoStatus`].
pub(crate) fn write_status(res: io::Result<usize>) -> io::Result<IoStatus> {
    match res {
        Ok(n) => Ok(IoStatus::Ready(n)),
        Err(e) => classify_error(e),
    }
}

fn classify_error(e: io::Error) -> io::Result<IoStatus> {
    match e.kind() {
        io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Ok(IoStatus::Disconnected),
        _ => Err(e),
    }
}
