//! Message envelope and its wire codec.
//!
//! Every message is a fixed 16-byte header followed by the payload:
//!
//! ```text
//! [u32 BE object_id] [u32 BE command_id] [u32 BE cookie] [u32 BE payload_len] [payload]
//! ```
//!
//! Requests carry the tagged arguments as payload, replies a single tagged
//! value (REPLY) or a string value (ERROR). Signal and broadcast deliveries
//! reuse the same envelope with the subscriber's cookie.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{IpcError, Result};
use super::ids::{command, ObjectId};
use super::value::TypedValue;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 16;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// One framed protocol message.
///
/// Ids are kept raw so that out-of-range values can still be answered
/// with an ERROR reply addressed to what the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Target (request) or source (reply) object id.
    pub object_id: u32,
    /// Command id, or REPLY/ERROR/SIGNAL/BROADCAST.
    pub command_id: u32,
    /// Client-chosen correlation token.
    pub cookie: u32,
    /// Encoded payload.
    pub payload: Bytes,
}

impl Message {
    /// Build a message from already-encoded payload bytes.
    pub fn new(object_id: u32, command_id: u32, cookie: u32, payload: Bytes) -> Self {
        Self {
            object_id,
            command_id,
            cookie,
            payload,
        }
    }

    /// Build a request whose payload is `args`, each tagged, in order.
    pub fn request(object: ObjectId, command_id: u32, cookie: u32, args: &[TypedValue]) -> Self {
        let mut payload = BytesMut::new();
        for arg in args {
            arg.encode(&mut payload);
        }
        Self::new(object.as_u32(), command_id, cookie, payload.freeze())
    }

    /// Successful reply to a request on `object_id`.
    pub fn reply(object_id: u32, cookie: u32, value: &TypedValue) -> Self {
        Self::new(object_id, command::REPLY, cookie, value.to_bytes())
    }

    /// Like [`reply`](Self::reply), but fails instead of producing a
    /// message the peer would reject.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::LimitExceeded`] from [`TypedValue::to_wire_bytes`].
    pub fn checked_reply(object_id: u32, cookie: u32, value: &TypedValue) -> Result<Self> {
        Ok(Self::new(object_id, command::REPLY, cookie, value.to_wire_bytes()?))
    }

    /// Error reply to a request on `object_id`.
    pub fn error(object_id: u32, cookie: u32, message: &str) -> Self {
        Self::new(
            object_id,
            command::ERROR,
            cookie,
            TypedValue::from(message).to_bytes(),
        )
    }

    /// Signal delivery with a pre-encoded value.
    pub(crate) fn signal(cookie: u32, encoded: Bytes) -> Self {
        Self::new(ObjectId::Signal.as_u32(), command::SIGNAL, cookie, encoded)
    }

    /// Broadcast delivery with a pre-encoded value.
    pub(crate) fn broadcast(cookie: u32, encoded: Bytes) -> Self {
        Self::new(ObjectId::Signal.as_u32(), command::BROADCAST, cookie, encoded)
    }

    /// Encode header and payload into a wire-format buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.object_id);
        buf.put_u32(self.command_id);
        buf.put_u32(self.cookie);
        // An oversized payload saturates so the peer rejects the frame.
        buf.put_u32(u32::try_from(self.payload.len()).unwrap_or(u32::MAX));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode the payload as a single tagged value (replies, deliveries).
    pub fn value(&self) -> Result<TypedValue> {
        let mut payload = &self.payload[..];
        TypedValue::decode(&mut payload)
    }

    /// `true` if this is an ERROR reply.
    pub fn is_error(&self) -> bool {
        self.command_id == command::ERROR
    }
}

/// Incremental message decoder that handles partial reads.
///
/// Feed bytes via [`MessageDecoder::feed`] and extract complete messages.
/// A message may arrive split across any number of reads.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete messages.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Protocol`] if a header announces a payload above
    /// [`MAX_PAYLOAD_LEN`]. The decoder is unusable afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let mut header = &self.buf[..HEADER_LEN];
            let object_id = header.get_u32();
            let command_id = header.get_u32();
            let cookie = header.get_u32();
            let payload_len = header.get_u32();

            if payload_len > MAX_PAYLOAD_LEN {
                return Err(IpcError::Protocol(format!(
                    "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
                )));
            }

            let total = HEADER_LEN + payload_len as usize;
            if self.buf.len() < total {
                break;
            }

            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(payload_len as usize).freeze();
            messages.push(Message::new(object_id, command_id, cookie, payload));
        }

        Ok(messages)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
