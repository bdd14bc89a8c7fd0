//! Service lifecycle: bind endpoints, hot-swap them, tear them down.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::dispatch::Dispatcher;
use super::error::{IpcError, Result};
use super::hub::SignalHub;
use super::registry::ObjectRegistry;
use super::server::Server;
use super::transport::{self, Endpoint};

/// What to do when some endpoints of a list fail to bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindPolicy {
    /// Any failure shuts down the endpoints already bound and fails start.
    #[default]
    AllOrNothing,
    /// Failures are logged and skipped; start fails only if nothing bound.
    BestEffort,
}

impl FromStr for BindPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim() {
            "all_or_nothing" => Ok(Self::AllOrNothing),
            "best_effort" => Ok(Self::BestEffort),
            other => Err(format!(
                "unknown bind policy '{other}' (expected all_or_nothing or best_effort)"
            )),
        }
    }
}

impl fmt::Display for BindPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AllOrNothing => "all_or_nothing",
            Self::BestEffort => "best_effort",
        })
    }
}

/// The IPC subsystem as seen by the daemon.
///
/// Owns the object registry and the signal hub; servers are created from
/// an endpoint list and attached to the hub.
#[derive(Debug, Clone)]
pub struct IpcService {
    dispatcher: Arc<Dispatcher>,
    hub: Arc<SignalHub>,
}

impl IpcService {
    /// Create a service dispatching against `registry`. No endpoint is
    /// bound until [`start`](Self::start).
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(registry)),
            hub: Arc::new(SignalHub::new()),
        }
    }

    /// Shared object registry.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        self.dispatcher.registry()
    }

    /// Signal hub for publishing notifications.
    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }

    /// Bind every endpoint in `spec` (`;`-separated) and start serving.
    ///
    /// Returns the number of endpoints now served by this call.
    ///
    /// # Errors
    ///
    /// - [`IpcError::Endpoint`] if a descriptor cannot be parsed
    /// - [`IpcError::Bind`] under [`BindPolicy::AllOrNothing`] when an
    ///   endpoint fails; nothing stays bound
    /// - [`IpcError::NoEndpointBound`] if nothing could be bound
    pub fn start(&self, spec: &str, policy: BindPolicy) -> Result<usize> {
        let endpoints = transport::parse_endpoints(spec)?;
        if endpoints.is_empty() {
            log::error!("[Ipc] No endpoints in '{spec}'");
            return Err(IpcError::NoEndpointBound);
        }

        let mut started = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            match transport::listen(endpoint) {
                Ok(listener) => started.push(Server::start(listener, Arc::clone(&self.dispatcher))),
                Err(e) => match policy {
                    BindPolicy::AllOrNothing => {
                        log::error!("[Ipc] {e}; releasing {} bound endpoint(s)", started.len());
                        for mut server in started {
                            server.shutdown();
                        }
                        return Err(e);
                    }
                    BindPolicy::BestEffort => log::error!("[Ipc] {e}; skipping"),
                },
            }
        }

        if started.is_empty() {
            return Err(IpcError::NoEndpointBound);
        }

        let count = started.len();
        for server in started {
            self.hub.attach(server);
        }
        log::info!("[Ipc] Serving {count} of {} endpoint(s)", endpoints.len());
        Ok(count)
    }

    /// Replace every running server with ones built from `spec`.
    ///
    /// The old servers are shut down first so the same endpoints can be
    /// rebound. If the new list fails the service is left down.
    pub fn reconfigure(&self, spec: &str, policy: BindPolicy) -> Result<usize> {
        log::info!("[Ipc] Reconfiguring endpoints to '{spec}'");
        self.hub.shutdown_all();
        self.start(spec, policy)
    }

    /// Shut down every running server.
    pub fn shutdown(&self) {
        self.hub.shutdown_all();
    }

    /// Endpoints currently served.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.hub.endpoints()
    }

    /// `true` if at least one endpoint is served.
    pub fn is_running(&self) -> bool {
        self.hub.server_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_policy_parsing() {
        assert_eq!("best_effort".parse::<BindPolicy>().unwrap(), BindPolicy::BestEffort);
        assert_eq!(" all_or_nothing ".parse::<BindPolicy>().unwrap(), BindPolicy::AllOrNothing);
        assert!("sometimes".parse::<BindPolicy>().is_err());
        assert_eq!(BindPolicy::default(), BindPolicy::AllOrNothing);
        assert_eq!(
            serde_json::to_string(&BindPolicy::BestEffort).unwrap(),
            "\"best_effort\""
        );
    }

    #[tokio::test]
    async fn test_start_multiple_endpoints() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a.sock");
        let spec = format!("unix://{};tcp://127.0.0.1:0", a.display());

        let service = IpcService::new(Arc::new(ObjectRegistry::new()));
        assert_eq!(service.start(&spec, BindPolicy::AllOrNothing).unwrap(), 2);
        assert!(service.is_running());
        assert!(a.exists());

        service.shutdown();
        assert!(!service.is_running());
        assert!(!a.exists());
    }

    #[tokio::test]
    async fn test_all_or_nothing_rolls_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let good = tmp.path().join("good.sock");
        let bad = tmp.path().join("b".repeat(120)).join("bad.sock");
        let spec = format!("{};{}", good.display(), bad.display());

        let service = IpcService::new(Arc::new(ObjectRegistry::new()));
        let err = service.start(&spec, BindPolicy::AllOrNothing).unwrap_err();
        assert!(matches!(err, IpcError::Bind { .. }), "{err}");
        assert!(!service.is_running());
        assert!(!good.exists());
    }

    #[tokio::test]
    async fn test_best_effort_keeps_good_endpoints() {
        let tmp = tempfile::TempDir::new().unwrap();
        let good = tmp.path().join("good.sock");
        let bad = tmp.path().join("b".repeat(120)).join("bad.sock");
        let spec = format!("{};{}", bad.display(), good.display());

        let service = IpcService::new(Arc::new(ObjectRegistry::new()));
        assert_eq!(service.start(&spec, BindPolicy::BestEffort).unwrap(), 1);
        assert_eq!(service.endpoints(), vec![Endpoint::Unix(good.clone())]);

        let only_bad = format!("{}", bad.display());
        assert!(matches!(
            service.reconfigure(&only_bad, BindPolicy::BestEffort),
            Err(IpcError::NoEndpointBound)
        ));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_invalid_or_empty_spec() {
        let service = IpcService::new(Arc::new(ObjectRegistry::new()));
        assert!(matches!(
            service.start("ftp://x:1", BindPolicy::BestEffort),
            Err(IpcError::Endpoint(_))
        ));
        assert!(matches!(
            service.start(" ; ", BindPolicy::BestEffort),
            Err(IpcError::NoEndpointBound)
        ));
    }
}
