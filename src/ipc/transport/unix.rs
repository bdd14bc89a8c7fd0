//! Unix domain socket transport.

use std::future::poll_fn;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::task::Poll;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

use super::{read_status, write_status, Connection, Endpoint, IoStatus, Listener};

/// sun_path is 104 bytes on macOS, 108 on Linux; use the conservative limit.
const MAX_SOCKET_PATH: usize = 104;

/// Listening Unix socket.
#[derive(Debug)]
pub struct UnixTransportListener {
    listener: Mutex<Option<UnixListener>>,
    endpoint: Endpoint,
    path: PathBuf,
}

impl UnixTransportListener {
    /// Bind at `path`.
    ///
    /// Removes any stale socket file, creates the parent directory and
    /// restricts the socket to its owner (0600).
    pub fn bind(path: &Path) -> io::Result<Self> {
        let path_len = path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "socket path too long ({path_len} bytes, max {})",
                    MAX_SOCKET_PATH - 1
                ),
            ));
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = std::os::unix::net::UnixListener::bind(path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            endpoint: Endpoint::Unix(path.to_path_buf()),
            path: path.to_path_buf(),
        })
    }

    fn socket(&self) -> MutexGuard<'_, Option<UnixListener>> {
        self.listener.lock().expect("unix listener mutex poisoned")
    }
}

#[async_trait]
impl Listener for UnixTransportListener {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        let (stream, _addr) = poll_fn(|cx| match self.socket().as_ref() {
            Some(listener) => listener.poll_accept(cx),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            ))),
        })
        .await?;
        Ok(Box::new(UnixConnection::new(stream, self.path.display().to_string())))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn close(&self) {
        if self.socket().take().is_none() {
            return;
        }
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("[Ipc] Failed to remove socket {}: {e}", self.path.display());
            }
        }
    }
}

/// Accepted (or connected) Unix socket stream.
#[derive(Debug)]
pub struct UnixConnection {
    stream: UnixStream,
    peer: String,
}

impl UnixConnection {
    /// Wrap a connected stream; `peer` is used in log lines.
    pub fn new(stream: UnixStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl Connection for UnixConnection {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_bind_removes_stale_socket_and_close_cleans_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stale.sock");
        std::fs::write(&path, "stale").unwrap();

        let listener = UnixTransportListener::bind(&path).unwrap();
        assert!(path.exists());
        assert_eq!(listener.endpoint(), &Endpoint::Unix(path.clone()));

        listener.close();
        assert!(!path.exists());
        listener.close();
        assert!(listener.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_path_length_validation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a".repeat(200)).join("x.sock");
        let err = UnixTransportListener::bind(&path).unwrap_err();
        assert!(err.to_string().contains("too long"), "{err}");
    }

    #[tokio::test]
    async fn test_accepted_connection_reads_and_reports_disconnect() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("io.sock");
        let listener = UnixTransportListener::bind(&path).unwrap();

        let mut peer = UnixStream::connect(&path).await.unwrap();
        let conn = listener.accept().await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(conn.try_read(&mut buf).unwrap(), IoStatus::WouldBlock);

        peer.write_all(b"abc").await.unwrap();
        conn.readable().await.unwrap();
        let mut got = IoStatus::WouldBlock;
        while got == IoStatus::WouldBlock {
            conn.readable().await.unwrap();
            got = conn.try_read(&mut buf).unwrap();
        }
        assert_eq!(got, IoStatus::Ready(3));
        assert_eq!(&buf[..3], b"abc");

        drop(peer);
        let mut got = IoStatus::WouldBlock;
        while got == IoStatus::WouldBlock {
            conn.readable().await.unwrap();
            got = conn.try_read(&mut buf).unwrap();
        }
        assert_eq!(got, IoStatus::Disconnected);
        conn.close();
    }
}
