//! Async client for talking to a running daemon.
//!
//! Used by the `mediad ping` command and by the integration tests. Replies
//! are matched to requests by cookie; signal and broadcast deliveries that
//! arrive while waiting for a reply are kept for [`IpcClient::recv`].

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use super::error::{IpcError, Result};
use super::ids::{command, ObjectId, SignalId};
use super::message::{Message, MessageDecoder};
use super::transport::Endpoint;
use super::value::TypedValue;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Client side of one IPC connection.
pub struct IpcClient {
    endpoint: Endpoint,
    reader: Reader,
    writer: Writer,
    decoder: MessageDecoder,
    received: VecDeque<Message>,
    next_cookie: u32,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("endpoint", &self.endpoint)
            .field("next_cookie", &self.next_cookie)
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Connect to `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let (reader, writer) = match endpoint {
            Endpoint::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                (Box::new(r) as Reader, Box::new(w) as Writer)
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                (Box::new(r) as Reader, Box::new(w) as Writer)
            }
        };
        log::debug!("[Client] Connected to {endpoint}");

        Ok(Self {
            endpoint: endpoint.clone(),
            reader,
            writer,
            decoder: MessageDecoder::new(),
            received: VecDeque::new(),
            next_cookie: 1,
        })
    }

    /// Connect to the first endpoint of a `;`-separated endpoint list that
    /// accepts the connection.
    pub async fn connect_spec(spec: &str) -> Result<Self> {
        let mut last_err = IpcError::NoEndpointBound;
        for endpoint in super::transport::parse_endpoints(spec)? {
            match Self::connect(&endpoint).await {
                Ok(client) => return Ok(client),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Endpoint this client is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn cookie(&mut self) -> u32 {
        let cookie = self.next_cookie;
        self.next_cookie = self.next_cookie.wrapping_add(1).max(1);
        cookie
    }

    /// Write one raw message.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.writer.write_all(&msg.encode()).await?;
        Ok(())
    }

    /// Send a request and return its cookie without waiting for the reply.
    pub async fn request(&mut self, object: ObjectId, command_id: u32, args: &[TypedValue]) -> Result<u32> {
        let cookie = self.cookie();
        self.send(&Message::request(object, command_id, cookie, args)).await?;
        Ok(cookie)
    }

    /// Call a command and wait for its reply.
    ///
    /// # Errors
    ///
    /// An ERROR reply becomes [`IpcError::Application`] carrying the
    /// server's message.
    pub async fn call(&mut self, object: ObjectId, command_id: u32, args: &[TypedValue]) -> Result<TypedValue> {
        let cookie = self.request(object, command_id, args).await?;
        let reply = self.wait_reply(cookie).await?;
        let value = reply.value()?;
        if reply.is_error() {
            let text = value.as_str().unwrap_or("unknown error").to_string();
            return Err(IpcError::Application(text));
        }
        Ok(value)
    }

    /// Arm a single-shot signal; returns the cookie its delivery will carry.
    pub async fn register_signal(&mut self, signal: SignalId) -> Result<u32> {
        self.control(command::SIGNAL, signal).await
    }

    /// Subscribe to a broadcast; returns the subscription cookie.
    pub async fn register_broadcast(&mut self, signal: SignalId) -> Result<u32> {
        self.control(command::BROADCAST, signal).await
    }

    /// Drop a broadcast subscription made with `cookie`.
    pub async fn unregister_broadcast(&mut self, signal: SignalId, cookie: u32) -> Result<()> {
        let args = [TypedValue::UInt32(signal.as_u32())];
        let msg = Message::request(ObjectId::Signal, command::BROADCAST_UNREGISTER, cookie, &args);
        self.send(&msg).await
    }

    async fn control(&mut self, command_id: u32, signal: SignalId) -> Result<u32> {
        self.request(ObjectId::Signal, command_id, &[TypedValue::UInt32(signal.as_u32())])
            .await
    }

    /// Next message from the server, in arrival order.
    pub async fn recv(&mut self) -> Result<Message> {
        if let Some(msg) = self.received.pop_front() {
            return Ok(msg);
        }
        self.read_more().await?;
        self.received
            .pop_front()
            .ok_or_else(|| IpcError::Protocol("no message decoded".to_string()))
    }

    async fn wait_reply(&mut self, cookie: u32) -> Result<Message> {
        loop {
            let found = self.received.iter().position(|m| {
                m.cookie == cookie && matches!(m.command_id, command::REPLY | command::ERROR)
            });
            if let Some(index) = found {
                if let Some(msg) = self.received.remove(index) {
                    return Ok(msg);
                }
            }
            self.read_more().await?;
        }
    }

    /// Read until at least one more message is decoded.
    async fn read_more(&mut self) -> Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(IpcError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection",
                )));
            }
            let messages = self.decoder.feed(&buf[..n])?;
            if !messages.is_empty() {
                self.received.extend(messages);
                return Ok(());
            }
        }
    }
}
