//! Daemon lifecycle.
//!
//! Builds the object registry, registers the built-in MAIN object, serves
//! the configured endpoints and runs until SIGINT/SIGTERM or a client
//! calls `main.quit`. SIGHUP reloads the configuration and swaps the
//! listening endpoints without dropping the registry.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::ipc::{
    CommandError, IpcObject, IpcService, ObjectId, ObjectRegistry, SignalHub, SignalId,
    TypedValue, ValueType,
};

/// Daemon version reported by `main.stats`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version clients must announce in `main.hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Time given to queued replies and the quit broadcast before shutdown.
const QUIT_GRACE: Duration = Duration::from_millis(200);

/// Command ids of the MAIN object.
pub mod main_cmd {
    /// `hello(protocol: u32, client: string) -> u32`
    pub const HELLO: u32 = 2;
    /// `quit() -> none`
    pub const QUIT: u32 = 3;
    /// `stats() -> dict`
    pub const STATS: u32 = 4;
}

/// A running daemon.
#[derive(Debug)]
pub struct Daemon {
    service: IpcService,
    config: Config,
    ipc_override: Option<String>,
    quit: CancellationToken,
}

impl Daemon {
    /// Create the daemon and register its built-in objects. Nothing is
    /// bound until [`start`](Self::start).
    ///
    /// `ipc_override` replaces the configured endpoints, also across
    /// reloads.
    pub fn new(config: Config, ipc_override: Option<String>) -> Result<Self> {
        let registry = Arc::new(ObjectRegistry::new());
        let service = IpcService::new(Arc::clone(&registry));
        let quit = CancellationToken::new();

        let main = main_object(Arc::downgrade(service.hub()), quit.clone(), Instant::now())
            .context("Failed to build main object")?;
        registry
            .register(ObjectId::Main, Arc::new(main))
            .context("Failed to register main object")?;

        Ok(Self {
            service,
            config,
            ipc_override,
            quit,
        })
    }

    fn ipc_spec(&self) -> &str {
        self.ipc_override.as_deref().unwrap_or(&self.config.ipc_socket)
    }

    /// Bind the configured endpoints.
    pub fn start(&self) -> Result<usize> {
        let spec = self.ipc_spec();
        self.service
            .start(spec, self.config.bind_policy)
            .with_context(|| format!("Failed to set up IPC on '{spec}'"))
    }

    /// IPC service (registry, hub, endpoints).
    pub fn service(&self) -> &IpcService {
        &self.service
    }

    /// Token cancelled when a client asks the daemon to quit.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Re-read the configuration and swap endpoints.
    pub fn reload(&mut self) -> Result<usize> {
        self.config = Config::load()?;
        let spec = self.ipc_spec().to_string();
        self.service
            .reconfigure(&spec, self.config.bind_policy)
            .with_context(|| format!("Failed to reconfigure IPC to '{spec}'"))
    }

    /// Serve until a shutdown signal or `main.quit`, then tear down.
    pub async fn run(mut self) -> Result<()> {
        let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        log::info!("mediad v{VERSION} serving {:?}", self.service.endpoints());

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("Failed to listen for SIGINT")?;
                    log::info!("Received SIGINT, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    log::info!("Received SIGTERM, shutting down");
                    break;
                }
                () = self.quit.cancelled() => {
                    log::info!("Quit requested by client, shutting down");
                    tokio::time::sleep(QUIT_GRACE).await;
                    break;
                }
                _ = hangup.recv() => {
                    log::info!("Received SIGHUP, reloading configuration");
                    if let Err(e) = self.reload() {
                        log::error!("{e:#}");
                    }
                }
            }
        }

        self.service.shutdown();
        Ok(())
    }
}

/// Build the MAIN object.
///
/// Handlers hold the hub weakly: the hub owns the servers, which own the
/// dispatcher, which owns the registry holding this object.
fn main_object(
    hub: Weak<SignalHub>,
    quit: CancellationToken,
    started: Instant,
) -> crate::ipc::error::Result<IpcObject> {
    let stats_hub = hub.clone();

    IpcObject::builder("main")
        .command(
            main_cmd::HELLO,
            &[ValueType::UInt32, ValueType::String],
            |args| {
                let protocol = args.u32(0)?;
                let client = args.str(1)?;
                if protocol != PROTOCOL_VERSION {
                    log::info!("Client '{client}' speaks protocol {protocol}, rejecting");
                    return Err(CommandError::new(format!(
                        "protocol version mismatch: client {protocol}, daemon {PROTOCOL_VERSION}"
                    )));
                }
                log::info!("Client '{client}' said hello");
                Ok(TypedValue::UInt32(PROTOCOL_VERSION))
            },
        )
        .command(main_cmd::QUIT, &[], move |_| {
            let uptime = uptime_secs(started);
            if let Some(hub) = hub.upgrade() {
                hub.publish_broadcast(SignalId::Quit, &TypedValue::UInt32(uptime));
            }
            quit.cancel();
            Ok(TypedValue::None)
        })
        .command(main_cmd::STATS, &[], move |_| {
            let clients = stats_hub.upgrade().map_or(0, |hub| hub.connection_count());
            let stats = [
                ("version", TypedValue::from(VERSION)),
                ("uptime", TypedValue::UInt32(uptime_secs(started))),
                ("clients", TypedValue::UInt32(u32::try_from(clients).unwrap_or(u32::MAX))),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<std::collections::BTreeMap<_, _>>();
            Ok(TypedValue::Dict(stats))
        })
        .build()
}

fn uptime_secs(started: Instant) -> u32 {
    u32::try_from(started.elapsed().as_secs()).unwrap_or(u32::MAX)
}
