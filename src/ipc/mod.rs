//! Client/server control protocol for the daemon.
//!
//! Clients connect over Unix or TCP sockets, call commands on registered
//! server-side objects and subscribe to signals (single-shot) and
//! broadcasts (persistent). Every subsystem of the daemon exposes its
//! remote API through this layer.
//!
//! # Architecture
//!
//! ```text
//!  IpcService ──owns──► SignalHub ──► Server (per endpoint)
//!      │                                 │ accept loop task
//!      │ Arc<Dispatcher>                 ▼
//!      ▼                              ClientConn (per connection, actor task)
//!  ObjectRegistry ◄── lookup ──────── read → decode → dispatch → enqueue reply
//!      ▲                                 ▲
//!      │ register/unregister             │ publish / publish_broadcast
//!  daemon subsystems ────────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! 16-byte big-endian header `[object_id][command_id][cookie][payload_len]`
//! followed by tagged values. See [`message`] and [`value`].

pub mod client;
pub mod client_conn;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod ids;
pub mod message;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;
pub mod value;

pub use client::IpcClient;
pub use client_conn::{ClientConn, ConnectionId};
pub use dispatch::Dispatcher;
pub use error::{CommandError, IpcError};
pub use hub::SignalHub;
pub use ids::{ObjectId, SignalId};
pub use message::Message;
pub use registry::{CommandArgs, IpcObject, ObjectRegistry};
pub use server::Server;
pub use service::{BindPolicy, IpcService};
pub use transport::Endpoint;
pub use value::{TypedValue, ValueType};
