//! Request dispatch.
//!
//! Turns one incoming [`Message`] into at most one reply. Requests on the
//! reserved control object update the sender's subscription tables and get
//! no reply; everything else is routed through the [`ObjectRegistry`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Buf;

use super::error::{IpcError, Result};
use super::ids::{command, ObjectId, SignalId};
use super::message::Message;
use super::registry::{CommandArgs, ObjectRegistry};
use super::value::{TypedValue, ValueType};

/// Per-client subscription tables mutated by control requests.
pub trait Subscriptions {
    /// Arm a single-shot signal, replacing any earlier cookie.
    fn register_signal(&self, signal: SignalId, cookie: u32);

    /// Add a persistent broadcast subscription.
    fn register_broadcast(&self, signal: SignalId, cookie: u32);

    /// Drop the broadcast subscription made with `cookie`.
    fn unregister_broadcast(&self, signal: SignalId, cookie: u32);
}

/// Routes requests to registered objects.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ObjectRegistry>,
}

impl Dispatcher {
    /// Dispatch against `registry`.
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self { registry }
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Handle one request; returns the reply to enqueue, if any.
    pub fn dispatch(&self, msg: &Message, subs: &dyn Subscriptions) -> Option<Message> {
        if msg.object_id == ObjectId::Signal.as_u32() {
            return Self::dispatch_control(msg, subs);
        }

        let reply = self
            .call(msg)
            .and_then(|value| Message::checked_reply(msg.object_id, msg.cookie, &value));
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!(
                    "[Ipc] Request obj={} cmd={} cookie={} failed: {e}",
                    msg.object_id,
                    msg.command_id,
                    msg.cookie
                );
                Message::error(msg.object_id, msg.cookie, &e.to_string())
            }
        };
        Some(reply)
    }

    fn call(&self, msg: &Message) -> Result<TypedValue> {
        let object = self.registry.lookup(msg.object_id)?;
        let cmd = object
            .command(msg.command_id)
            .ok_or(IpcError::UnknownCommand {
                object: msg.object_id,
                command: msg.command_id,
            })?;
        let args = decode_args(cmd.signature(), &msg.payload)?;
        log::trace!(
            "[Ipc] {}.{} cookie={}",
            object.name(),
            msg.command_id,
            msg.cookie
        );

        // A panicking handler must not take the connection down with it.
        match catch_unwind(AssertUnwindSafe(|| cmd.call(&args))) {
            Ok(result) => Ok(result?),
            Err(panic_info) => {
                let detail = panic_info
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic_info.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                log::error!(
                    "[Ipc] Handler {}.{} panicked: {detail}",
                    object.name(),
                    msg.command_id
                );
                Err(IpcError::HandlerPanic {
                    object: object.name().to_string(),
                    command: msg.command_id,
                })
            }
        }
    }

    fn dispatch_control(msg: &Message, subs: &dyn Subscriptions) -> Option<Message> {
        let register: fn(&dyn Subscriptions, SignalId, u32) = match msg.command_id {
            command::SIGNAL => |s, id, cookie| s.register_signal(id, cookie),
            command::BROADCAST => |s, id, cookie| s.register_broadcast(id, cookie),
            command::BROADCAST_UNREGISTER => |s, id, cookie| s.unregister_broadcast(id, cookie),
            other => {
                let err = IpcError::UnknownCommand {
                    object: msg.object_id,
                    command: other,
                };
                return Some(Message::error(msg.object_id, msg.cookie, &err.to_string()));
            }
        };

        match signal_arg(&msg.payload) {
            Some(signal) => register(subs, signal, msg.cookie),
            None => log::warn!(
                "[Ipc] Dropping control request cmd={} cookie={}: bad signal id",
                msg.command_id,
                msg.cookie
            ),
        }
        None
    }
}

/// Decode the single `UInt32` signal id carried by a control request.
fn signal_arg(payload: &[u8]) -> Option<SignalId> {
    let mut buf = payload;
    match TypedValue::decode(&mut buf) {
        Ok(TypedValue::UInt32(raw)) => SignalId::try_from(raw).ok(),
        _ => None,
    }
}

/// Decode request arguments against a declared signature.
///
/// Bytes after the last declared argument are ignored.
///
/// # Errors
///
/// Returns [`IpcError::ArgumentDecode`] on the first value that is
/// malformed, truncated or of the wrong type.
pub fn decode_args(signature: &[ValueType], payload: &[u8]) -> Result<CommandArgs> {
    let mut buf = payload;
    let mut values = Vec::with_capacity(signature.len());
    for expected in signature {
        if !buf.has_remaining() {
            return Err(IpcError::ArgumentDecode);
        }
        let value = TypedValue::decode(&mut buf).map_err(|_| IpcError::ArgumentDecode)?;
        if value.value_type() != *expected {
            return Err(IpcError::ArgumentDecode);
        }
        values.push(value);
    }
    Ok(CommandArgs::new(values))
}
