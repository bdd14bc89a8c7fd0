//! Error taxonomy for the IPC core.
//!
//! Which variants keep a connection open and which drop it is decided by
//! the client actor: `Protocol` and `Transport` disconnect, everything the
//! dispatcher produces becomes an ERROR reply.

use std::io;

use thiserror::Error;

/// Errors produced by the IPC core.
#[derive(Error, Debug)]
pub enum IpcError {
    /// Malformed message header; the connection is dropped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A typed value could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Object id out of range or nothing registered there.
    #[error("Unknown object: {0}")]
    UnknownObject(u32),

    /// Command id out of range or not in the object's table.
    #[error("Unknown command {command} on object {object}")]
    UnknownCommand {
        /// Target object id.
        object: u32,
        /// Requested command id.
        command: u32,
    },

    /// A value is too large or too deeply nested to put on the wire.
    #[error("Value exceeds protocol limits: {0}")]
    LimitExceeded(String),

    /// Arguments did not match the declared signature.
    #[error("Corrupt msg")]
    ArgumentDecode,

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// A command handler panicked.
    #[error("Internal error in {object}.{command}")]
    HandlerPanic {
        /// Name of the object the command belongs to.
        object: String,
        /// Command id.
        command: u32,
    },

    /// Handler-reported domain failure, passed through verbatim.
    #[error("{0}")]
    Application(String),

    /// The reserved control object cannot be registered.
    #[error("Object id {0} is reserved")]
    ReservedObject(u32),

    /// A command definition is invalid (bad id or signature).
    #[error("Invalid command definition: {0}")]
    InvalidCommand(String),

    /// An endpoint descriptor could not be parsed.
    #[error("Invalid endpoint '{0}'")]
    Endpoint(String),

    /// Binding a listening endpoint failed.
    #[error("Couldn't listen on '{endpoint}': {source}")]
    Bind {
        /// Endpoint descriptor that failed.
        endpoint: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// None of the configured endpoints could be bound.
    #[error("No IPC endpoint could be bound")]
    NoEndpointBound,
}

/// Result alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Failure reported by a command handler.
///
/// The message is sent to the client unchanged in an ERROR reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<CommandError> for IpcError {
    fn from(err: CommandError) -> Self {
        IpcError::Application(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_decode_message_is_stable() {
        // Clients match on this exact text.
        assert_eq!(IpcError::ArgumentDecode.to_string(), "Corrupt msg");
    }

    #[test]
    fn test_application_error_is_verbatim() {
        let err: IpcError = CommandError::new("no such entry").into();
        assert_eq!(err.to_string(), "no such entry");
    }

    #[test]
    fn test_unknown_command_mentions_both_ids() {
        let err = IpcError::UnknownCommand { object: 5, command: 9 };
        let text = err.to_string();
        assert!(text.contains('5') && text.contains('9'), "{text}");
    }
}
