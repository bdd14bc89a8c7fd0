//! Signal and broadcast fan-out.
//!
//! The hub owns the list of running servers. Collaborators publish through
//! it without knowing which clients exist: a signal goes once to every
//! client that armed it, a broadcast goes to every subscription and the
//! subscriptions stay in place.
//!
//! Lock order is hub → server → client. The value is encoded once per
//! publish and the bytes are shared between recipients.

use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use super::ids::SignalId;
use super::server::Server;
use super::transport::Endpoint;
use super::value::TypedValue;

/// Registry of running servers used for notification fan-out.
#[derive(Debug, Default)]
pub struct SignalHub {
    servers: Mutex<Vec<Server>>,
}

impl SignalHub {
    /// Create a hub with no servers.
    pub fn new() -> Self {
        Self::default()
    }

    fn servers(&self) -> MutexGuard<'_, Vec<Server>> {
        self.servers.lock().expect("signal hub mutex poisoned")
    }

    /// Add a running server.
    pub fn attach(&self, server: Server) {
        self.servers().push(server);
    }

    /// Shut down and forget every server.
    pub fn shutdown_all(&self) {
        let servers = std::mem::take(&mut *self.servers());
        for mut server in servers {
            server.shutdown();
        }
    }

    /// Number of running servers.
    pub fn server_count(&self) -> usize {
        self.servers().len()
    }

    /// Endpoints of every running server.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.servers().iter().map(|s| s.endpoint().clone()).collect()
    }

    /// Connected clients across all servers.
    pub fn connection_count(&self) -> usize {
        self.servers().iter().map(Server::connection_count).sum()
    }

    /// Emit a single-shot signal.
    ///
    /// Every client holding a registration for `signal` receives one SIGNAL
    /// message with its cookie, and the registration is cleared. Returns
    /// the number of messages queued.
    ///
    /// A value that cannot be put on the wire is logged and not delivered;
    /// registrations stay armed.
    pub fn publish(&self, signal: SignalId, value: &TypedValue) -> usize {
        let Some(encoded) = Self::encode(signal, value) else {
            return 0;
        };
        let sent: usize = self
            .servers()
            .iter()
            .map(|server| server.publish_signal(signal, &encoded))
            .sum();
        log::debug!("[Ipc] Signal {signal:?} delivered to {sent} client(s)");
        sent
    }

    /// Emit a broadcast to every subscription. Returns the number of
    /// messages queued.
    pub fn publish_broadcast(&self, signal: SignalId, value: &TypedValue) -> usize {
        let Some(encoded) = Self::encode(signal, value) else {
            return 0;
        };
        let sent: usize = self
            .servers()
            .iter()
            .map(|server| server.publish_broadcast(signal, &encoded))
            .sum();
        log::debug!("[Ipc] Broadcast {signal:?} delivered {sent} time(s)");
        sent
    }

    fn encode(signal: SignalId, value: &TypedValue) -> Option<Bytes> {
        match value.to_wire_bytes() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                log::error!("[Ipc] Not publishing {signal:?}: {e}");
                None
            }
        }
    }

    /// `true` if any connected client armed `signal`.
    pub fn has_pending(&self, signal: SignalId) -> bool {
        self.servers().iter().any(|server| server.has_pending(signal))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;
    use crate::ipc::dispatch::Dispatcher;
    use crate::ipc::ids::{command, ObjectId};
    use crate::ipc::message::{Message, MessageDecoder};
    use crate::ipc::registry::ObjectRegistry;
    use crate::ipc::transport::unix::UnixTransportListener;

    fn start_server(hub: &SignalHub, path: &std::path::Path) {
        let listener = UnixTransportListener::bind(path).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(ObjectRegistry::new())));
        hub.attach(Server::start(Box::new(listener), dispatcher));
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for condition");
    }

    async fn read_one(stream: &mut UnixStream, decoder: &mut MessageDecoder) -> Message {
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("Timed out waiting for delivery")
                .unwrap();
            assert!(n > 0, "Connection closed");
            if let Some(msg) = decoder.feed(&buf[..n]).unwrap().into_iter().next() {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_clients_on_every_server() {
        let tmp = tempfile::TempDir::new().unwrap();
        let hub = SignalHub::new();
        let a_path = tmp.path().join("a.sock");
        let b_path = tmp.path().join("b.sock");
        start_server(&hub, &a_path);
        start_server(&hub, &b_path);
        assert_eq!(hub.server_count(), 2);

        let mut a = UnixStream::connect(&a_path).await.unwrap();
        let mut b = UnixStream::connect(&b_path).await.unwrap();
        let register = |cookie| {
            Message::request(
                ObjectId::Signal,
                command::SIGNAL,
                cookie,
                &[TypedValue::UInt32(SignalId::PlaylistChanged.as_u32())],
            )
            .encode()
        };
        a.write_all(&register(100)).await.unwrap();
        b.write_all(&register(200)).await.unwrap();

        wait_until(|| hub.connection_count() == 2).await;
        wait_until(|| {
            hub.servers()
                .iter()
                .all(|s| s.has_pending(SignalId::PlaylistChanged))
        })
        .await;
        assert!(hub.has_pending(SignalId::PlaylistChanged));

        assert_eq!(hub.publish(SignalId::PlaylistChanged, &TypedValue::UInt32(1)), 2);
        assert!(!hub.has_pending(SignalId::PlaylistChanged));
        assert_eq!(hub.publish(SignalId::PlaylistChanged, &TypedValue::UInt32(2)), 0);

        let got_a = read_one(&mut a, &mut MessageDecoder::new()).await;
        let got_b = read_one(&mut b, &mut MessageDecoder::new()).await;
        assert_eq!((got_a.cookie, got_a.command_id), (100, command::SIGNAL));
        assert_eq!((got_b.cookie, got_b.command_id), (200, command::SIGNAL));
        assert_eq!(got_a.value().unwrap(), TypedValue::UInt32(1));
    }

    #[tokio::test]
    async fn test_unencodable_value_is_not_published() {
        let tmp = tempfile::TempDir::new().unwrap();
        let hub = SignalHub::new();
        let path = tmp.path().join("big.sock");
        start_server(&hub, &path);

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let register = Message::request(
            ObjectId::Signal,
            command::SIGNAL,
            7,
            &[TypedValue::UInt32(SignalId::MedialibEntryUpdate.as_u32())],
        );
        stream.write_all(&register.encode()).await.unwrap();
        wait_until(|| hub.has_pending(SignalId::MedialibEntryUpdate)).await;

        let mut too_deep = TypedValue::None;
        for _ in 0..=crate::ipc::value::MAX_DEPTH {
            too_deep = TypedValue::List(vec![too_deep]);
        }
        assert_eq!(hub.publish(SignalId::MedialibEntryUpdate, &too_deep), 0);
        assert!(hub.has_pending(SignalId::MedialibEntryUpdate));

        assert_eq!(hub.publish(SignalId::MedialibEntryUpdate, &TypedValue::UInt32(3)), 1);
        let got = read_one(&mut stream, &mut MessageDecoder::new()).await;
        assert_eq!(got.cookie, 7);
        assert_eq!(got.value().unwrap(), TypedValue::UInt32(3));
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_servers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let hub = SignalHub::new();
        let path = tmp.path().join("x.sock");
        start_server(&hub, &path);
        assert_eq!(hub.endpoints(), vec![Endpoint::Unix(path.clone())]);

        hub.shutdown_all();
        assert_eq!(hub.server_count(), 0);
        assert!(!path.exists());
        assert_eq!(hub.publish_broadcast(SignalId::Quit, &TypedValue::None), 0);
    }
}
