//! TCP transport.

use std::future::poll_fn;
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::task::Poll;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{read_status, write_status, Connection, Endpoint, IoStatus, Listener};

/// Listening TCP socket.
///
/// [`Listener::close`] drops the socket, so the port can be bound again as
/// soon as it returns.
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: Mutex<Option<TcpListener>>,
    endpoint: Endpoint,
}

impl TcpTransportListener {
    /// Bind at `addr` (`host:port`). Port 0 picks a free port; the bound
    /// address is reflected in [`Listener::endpoint`].
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            endpoint: Endpoint::Tcp(local.to_string()),
        })
    }

    fn socket(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().expect("tcp listener mutex poisoned")
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        let (stream, addr) = poll_fn(|cx| match self.socket().as_ref() {
            Some(listener) => listener.poll_accept(cx),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            ))),
        })
        .await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection::new(stream, addr.to_string())))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn close(&self) {
        drop(self.socket().take());
    }
}

/// Accepted (or connected) TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: String,
}

impl TcpConnection {
    /// Wrap a connected stream; `peer` is used in log lines.
    pub fn new(stream: TcpStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<IoStatus> {
        read_status(self.stream.try_read(buf))
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<IoStatus> {
        write_status(self.stream.try_write(buf))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn close(self: Box<Self>) {
        drop(self.stream);
    }
}
