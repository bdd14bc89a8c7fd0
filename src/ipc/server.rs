//! IPC server: one listening endpoint plus its active clients.
//!
//! The accept loop runs as its own task and spawns a [`ClientConn`] actor
//! per connection. All clients share one [`Dispatcher`] and therefore one
//! object registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client_conn::{ClientConn, ConnectionId};
use super::dispatch::Dispatcher;
use super::ids::SignalId;
use super::transport::{Connection, Endpoint, Listener};

/// Back-off after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// State shared between the [`Server`] handle, its accept loop and its
/// clients (which hold it weakly).
#[derive(Debug)]
pub(crate) struct ServerShared {
    endpoint: Endpoint,
    clients: Mutex<HashMap<ConnectionId, Arc<ClientConn>>>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl ServerShared {
    fn clients(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ClientConn>>> {
        self.clients.lock().expect("server clients mutex poisoned")
    }

    pub(crate) fn remove_client(&self, id: ConnectionId) {
        self.clients().remove(&id);
    }

    fn add_client(self: &Arc<Self>, conn: Box<dyn Connection>) {
        let id = ConnectionId::next();
        let peer = conn.peer();
        let client = Arc::new(ClientConn::new(
            id,
            peer.clone(),
            Arc::downgrade(self),
            self.cancel.child_token(),
        ));
        self.clients().insert(id, Arc::clone(&client));
        log::info!("[Server] {id} connected on {} ({peer})", self.endpoint);

        tokio::spawn(client.run(conn, Arc::clone(&self.dispatcher)));
    }
}

/// A listening endpoint and the clients it accepted.
///
/// Dropping a `Server` shuts it down.
#[derive(Debug)]
pub struct Server {
    shared: Arc<ServerShared>,
    listener: Arc<dyn Listener>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Start accepting connections on `listener`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(listener: Box<dyn Listener>, dispatcher: Arc<Dispatcher>) -> Self {
        let listener: Arc<dyn Listener> = Arc::from(listener);
        let shared = Arc::new(ServerShared {
            endpoint: listener.endpoint().clone(),
            clients: Mutex::new(HashMap::new()),
            dispatcher,
            cancel: CancellationToken::new(),
        });

        log::info!("[Server] Listening on {}", shared.endpoint);

        let accept_handle = tokio::spawn(Self::accept_loop(
            Arc::clone(&listener),
            Arc::clone(&shared),
        ));

        Self {
            shared,
            listener,
            accept_handle: Some(accept_handle),
        }
    }

    async fn accept_loop(listener: Arc<dyn Listener>, shared: Arc<ServerShared>) {
        loop {
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => shared.add_client(conn),
                    Err(e) => {
                        log::error!("[Server] Accept error on {}: {e}", shared.endpoint);
                        tokio::select! {
                            () = shared.cancel.cancelled() => break,
                            () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }
        log::debug!("[Server] Accept loop on {} stopped", shared.endpoint);
    }

    /// Endpoint this server listens on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Number of currently connected clients.
    pub fn connection_count(&self) -> usize {
        self.shared.clients().len()
    }

    /// Snapshot of the connected clients.
    pub fn clients(&self) -> Vec<Arc<ClientConn>> {
        self.shared.clients().values().cloned().collect()
    }

    /// `true` until [`shutdown`](Self::shutdown) has been called.
    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Deliver `signal` to every client that armed it; returns the count.
    pub(crate) fn publish_signal(&self, signal: SignalId, encoded: &Bytes) -> usize {
        let clients = self.shared.clients();
        clients
            .values()
            .filter(|client| client.deliver_signal(signal, encoded))
            .count()
    }

    /// Deliver a broadcast to every subscription; returns the count.
    pub(crate) fn publish_broadcast(&self, signal: SignalId, encoded: &Bytes) -> usize {
        let clients = self.shared.clients();
        clients
            .values()
            .map(|client| client.deliver_broadcast(signal, encoded))
            .sum()
    }

    /// `true` if any client armed `signal`.
    pub(crate) fn has_pending(&self, signal: SignalId) -> bool {
        let clients = self.shared.clients();
        clients.values().any(|client| client.has_pending_signal(signal))
    }

    /// Stop accepting, release the endpoint and disconnect every client.
    ///
    /// The endpoint can be bound again as soon as this returns.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.accept_handle.take() else {
            return;
        };
        self.shared.cancel.cancel();
        self.listener.close();
        handle.abort();

        let clients: Vec<_> = self.shared.clients().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.disconnect();
        }
        log::info!(
            "[Server] Shut down {} ({} clients disconnected)",
            self.shared.endpoint,
            clients.len()
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;
    use crate::ipc::ids::{command, ObjectId};
    use crate::ipc::message::{Message, MessageDecoder};
    use crate::ipc::registry::{IpcObject, ObjectRegistry};
    use crate::ipc::transport::unix::UnixTransportListener;
    use crate::ipc::value::TypedValue;

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = Arc::new(ObjectRegistry::new());
        let main = IpcObject::builder("main")
            .command(2, &[], |_| Ok(TypedValue::from("pong")))
            .build()
            .unwrap();
        registry.register(ObjectId::Main, Arc::new(main)).unwrap();
        Arc::new(Dispatcher::new(registry))
    }

    async fn wait_for_count(server: &Server, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "Expected {expected} clients, got: {}",
                server.connection_count()
            )
        });
    }

    async fn ping(stream: &mut UnixStream, cookie: u32) -> Message {
        let req = Message::request(ObjectId::Main, 2, cookie, &[]);
        stream.write_all(&req.encode()).await.unwrap();

        let mut decoder = MessageDecoder::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("Timed out waiting for reply")
                .unwrap();
            assert!(n > 0, "Server closed the connection");
            if let Some(msg) = decoder.feed(&buf[..n]).unwrap().pop() {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_server_accepts_and_replies() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.sock");
        let listener = UnixTransportListener::bind(&path).unwrap();
        let mut server = Server::start(Box::new(listener), dispatcher());

        let mut stream = UnixStream::connect(&path).await.unwrap();
        wait_for_count(&server, 1).await;

        let reply = ping(&mut stream, 5).await;
        assert_eq!(reply.command_id, command::REPLY);
        assert_eq!(reply.cookie, 5);
        assert_eq!(reply.value().unwrap(), TypedValue::from("pong"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_one_client_leaving_does_not_affect_others() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.sock");
        let listener = UnixTransportListener::bind(&path).unwrap();
        let server = Server::start(Box::new(listener), dispatcher());

        let mut a = UnixStream::connect(&path).await.unwrap();
        let b = UnixStream::connect(&path).await.unwrap();
        let mut c = UnixStream::connect(&path).await.unwrap();
        wait_for_count(&server, 3).await;

        drop(b);
        wait_for_count(&server, 2).await;

        assert_eq!(ping(&mut a, 1).await.cookie, 1);
        assert_eq!(ping(&mut c, 2).await.cookie, 2);

        let mut d = UnixStream::connect(&path).await.unwrap();
        wait_for_count(&server, 3).await;
        assert_eq!(ping(&mut d, 3).await.cookie, 3);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients_and_removes_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.sock");
        let listener = UnixTransportListener::bind(&path).unwrap();
        let mut server = Server::start(Box::new(listener), dispatcher());

        let mut stream = UnixStream::connect(&path).await.unwrap();
        wait_for_count(&server, 1).await;
        let clients = server.clients();

        server.shutdown();
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
        assert!(clients[0].is_disconnected());
        assert!(!path.exists());
        assert!(UnixStream::connect(&path).await.is_err());

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("Timed out waiting for EOF")
            .unwrap_or(0);
        assert_eq!(n, 0);

        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_releases_tcp_port() {
        let listener = crate::ipc::transport::tcp::TcpTransportListener::bind("127.0.0.1:0").unwrap();
        let Endpoint::Tcp(addr) = listener.endpoint().clone() else {
            panic!("Expected Tcp endpoint");
        };
        let mut server = Server::start(Box::new(listener), dispatcher());

        for _ in 0..20 {
            server.shutdown();
            let rebound = crate::ipc::transport::tcp::TcpTransportListener::bind(&addr)
                .unwrap_or_else(|e| panic!("Expected {addr} to be free after shutdown, got: {e}"));
            server = Server::start(Box::new(rebound), dispatcher());
        }
        server.shutdown();
    }
}
