//! Per-connection actor for IPC clients (server side).
//!
//! Each accepted connection gets a [`ClientConn`] plus one tokio task that
//! owns the transport. The task reads and dispatches requests in arrival
//! order and drains the outbound queue whenever the socket is writable.
//!
//! The outbound queue and the subscription tables live behind a per-client
//! mutex so that the dispatcher (on this task) and the signal hub (on any
//! task) can enqueue concurrently. An empty → non-empty transition of the
//! queue wakes the actor through a [`Notify`] permit, which re-arms write
//! interest.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::dispatch::{Dispatcher, Subscriptions};
use super::error::{IpcError, Result};
use super::ids::{SignalId, SIGNAL_END};
use super::message::{Message, MessageDecoder};
use super::server::ServerShared;
use super::transport::{Connection, IoStatus};

/// Read chunk size.
const READ_CHUNK: usize = 64 * 1024;

/// Reads per readable event before the actor yields to its write path
/// and to other tasks.
const MAX_READS_PER_WAKEUP: usize = 16;

/// What the actor loop does after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Input is still pending but the read budget is spent.
    Yield,
    /// The peer went away.
    Closed,
}

/// Disconnects the client when the actor exits, including by unwinding.
struct DisconnectOnExit<'a>(&'a ClientConn);

impl Drop for DisconnectOnExit<'_> {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

/// Process-unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Mutable state guarded by the client lock.
#[derive(Debug)]
struct ClientState {
    outbound: VecDeque<Message>,
    /// Cookie per signal id; 0 means not armed.
    pending_signals: [u32; SIGNAL_END as usize],
    /// Cookies per broadcast id, in subscription order.
    pending_broadcasts: Vec<Vec<u32>>,
    disconnected: bool,
}

impl ClientState {
    fn new() -> Self {
        Self {
            outbound: VecDeque::new(),
            pending_signals: [0; SIGNAL_END as usize],
            pending_broadcasts: vec![Vec::new(); SIGNAL_END as usize],
            disconnected: false,
        }
    }

    fn clear(&mut self) {
        self.outbound.clear();
        self.pending_signals = [0; SIGNAL_END as usize];
        for cookies in &mut self.pending_broadcasts {
            cookies.clear();
        }
    }
}

/// Shared handle to one connected client.
///
/// The transport itself is owned by the actor task started with
/// [`ClientConn::run`]; this handle is what the server and the signal hub
/// keep.
pub struct ClientConn {
    id: ConnectionId,
    peer: String,
    server: Weak<ServerShared>,
    state: Mutex<ClientState>,
    write_wakeup: Notify,
    cancel: CancellationToken,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    pub(crate) fn new(
        id: ConnectionId,
        peer: String,
        server: Weak<ServerShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            server,
            state: Mutex::new(ClientState::new()),
            write_wakeup: Notify::new(),
            cancel,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer description from the transport.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// `true` once the client has disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }

    /// Number of messages waiting to be written.
    pub fn queued(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Queue a message for this client.
    ///
    /// Returns `false` (and drops the message) if the client has
    /// disconnected.
    pub fn enqueue(&self, msg: Message) -> bool {
        let mut state = self.lock();
        self.push(&mut state, msg)
    }

    fn push(&self, state: &mut ClientState, msg: Message) -> bool {
        if state.disconnected {
            return false;
        }
        let was_empty = state.outbound.is_empty();
        state.outbound.push_back(msg);
        if was_empty {
            self.write_wakeup.notify_one();
        }
        true
    }

    /// Deliver a signal if armed, consuming the registration.
    pub(crate) fn deliver_signal(&self, signal: SignalId, encoded: &Bytes) -> bool {
        let mut state = self.lock();
        let cookie = std::mem::take(&mut state.pending_signals[signal.index()]);
        if cookie == 0 {
            return false;
        }
        self.push(&mut state, Message::signal(cookie, encoded.clone()))
    }

    /// Deliver a broadcast to every subscription; returns the count.
    pub(crate) fn deliver_broadcast(&self, signal: SignalId, encoded: &Bytes) -> usize {
        let mut state = self.lock();
        let cookies = state.pending_broadcasts[signal.index()].clone();
        cookies
            .into_iter()
            .filter(|&cookie| self.push(&mut state, Message::broadcast(cookie, encoded.clone())))
            .count()
    }

    /// `true` if a signal registration is armed.
    pub(crate) fn has_pending_signal(&self, signal: SignalId) -> bool {
        self.lock().pending_signals[signal.index()] != 0
    }

    /// Disconnect this client.
    ///
    /// Drops queued output and subscriptions, stops the actor (which
    /// closes the transport) and removes the client from its server.
    /// Idempotent.
    pub fn disconnect(&self) {
        {
            let mut state = self.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.clear();
        }
        self.cancel.cancel();

        if let Some(server) = self.server.upgrade() {
            server.remove_client(self.id);
        }
        log::info!("[Client] {} disconnected ({})", self.id, self.peer);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().expect("client state mutex poisoned")
    }

    fn pop_outbound(&self) -> Option<Message> {
        self.lock().outbound.pop_front()
    }

    /// Actor loop. Runs until the peer goes away, a protocol error occurs
    /// or the client is cancelled.
    pub(crate) async fn run(self: Arc<Self>, conn: Box<dyn Connection>, dispatcher: Arc<Dispatcher>) {
        let exit_guard = DisconnectOnExit(&self);
        let mut decoder = MessageDecoder::new();
        let mut read_buf = vec![0u8; READ_CHUNK];
        let mut in_flight: Option<Bytes> = None;

        loop {
            if in_flight.is_none() {
                in_flight = self.pop_outbound().map(|msg| msg.encode());
            }
            let want_write = in_flight.is_some();

            let outcome = tokio::select! {
                () = self.cancel.cancelled() => break,
                ready = conn.readable() => match ready {
                    Ok(()) => self.on_readable(conn.as_ref(), &mut decoder, &mut read_buf, &dispatcher),
                    Err(e) => Err(e.into()),
                },
                ready = conn.writable(), if want_write => match ready {
                    Ok(()) => self.on_writable(conn.as_ref(), &mut in_flight),
                    Err(e) => Err(e.into()),
                },
                () = self.write_wakeup.notified(), if !want_write => Ok(Flow::Continue),
            };

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield) => tokio::task::yield_now().await,
                Ok(Flow::Closed) => {
                    log::debug!("[Client] {} closed by peer", self.id);
                    break;
                }
                Err(e) => {
                    log::warn!("[Client] {} dropped: {e}", self.id);
                    break;
                }
            }
        }

        drop(exit_guard);
        conn.close();
    }

    /// Read available bytes and dispatch every complete request, up to
    /// [`MAX_READS_PER_WAKEUP`] reads.
    fn on_readable(
        &self,
        conn: &dyn Connection,
        decoder: &mut MessageDecoder,
        buf: &mut [u8],
        dispatcher: &Dispatcher,
    ) -> Result<Flow> {
        for _ in 0..MAX_READS_PER_WAKEUP {
            match conn.try_read(buf)? {
                IoStatus::Ready(n) => {
                    for msg in decoder.feed(&buf[..n])? {
                        if let Some(reply) = dispatcher.dispatch(&msg, self) {
                            self.enqueue(reply);
                        }
                    }
                }
                IoStatus::WouldBlock => return Ok(Flow::Continue),
                IoStatus::Disconnected => return Ok(Flow::Closed),
            }
        }
        Ok(Flow::Yield)
    }

    /// Write queued output until empty or the socket would block.
    ///
    /// A partially written message stays in `in_flight` and resumes on the
    /// next writable event.
    fn on_writable(&self, conn: &dyn Connection, in_flight: &mut Option<Bytes>) -> Result<Flow> {
        while let Some(buf) = in_flight.as_mut() {
            match conn.try_write(buf)? {
                IoStatus::Ready(0) => {
                    return Err(IpcError::Protocol("zero-length write".to_string()));
                }
                IoStatus::Ready(n) => {
                    buf.advance(n);
                    if buf.is_empty() {
                        *in_flight = self.pop_outbound().map(|msg| msg.encode());
                    }
                }
                IoStatus::WouldBlock => return Ok(Flow::Continue),
                IoStatus::Disconnected => return Ok(Flow::Closed),
            }
        }
        Ok(Flow::Continue)
    }
}

impl Subscriptions for ClientConn {
    fn register_signal(&self, signal: SignalId, cookie: u32) {
        let mut state = self.lock();
        if !state.disconnected {
            state.pending_signals[signal.index()] = cookie;
        }
    }

    fn register_broadcast(&self, signal: SignalId, cookie: u32) {
        let mut state = self.lock();
        if state.disconnected {
            return;
        }
        let cookies = &mut state.pending_broadcasts[signal.index()];
        if !cookies.contains(&cookie) {
            cookies.push(cookie);
        }
    }

    fn unregister_broadcast(&self, signal: SignalId, cookie: u32) {
        let mut state = self.lock();
        state.pending_broadcasts[signal.index()].retain(|&c| c != cookie);
    }
}
