//! mediad - control-protocol core of a client/server media daemon.
//!
//! Clients talk to the daemon over Unix or TCP sockets using a compact
//! binary protocol: they call commands on server-side objects and subscribe
//! to signals and broadcasts. Subsystems expose their APIs by registering
//! objects and notify clients through the signal hub.
//!
//! # Modules
//!
//! - [`ipc`] - Typed values, framing, transports, dispatch, servers, fan-out
//! - [`daemon`] - Daemon lifecycle and the built-in MAIN object
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod daemon;
pub mod ipc;

// Re-export commonly used types
pub use config::Config;
pub use daemon::Daemon;
pub use ipc::{IpcClient, IpcService, ObjectRegistry, SignalHub, TypedValue};
