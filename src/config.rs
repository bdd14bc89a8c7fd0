//! Configuration loading and persistence.
//!
//! The daemon reads `config.json` from its config directory and applies
//! environment overrides on top. A missing or unreadable file falls back to
//! defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::ipc::BindPolicy;

/// File name inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for the daemon and the CLI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// `;`-separated list of IPC endpoints to listen on (daemon) or to try
    /// in order (client).
    pub ipc_socket: String,
    /// How to handle endpoints that fail to bind.
    pub bind_policy: BindPolicy,
    /// Name the CLI announces in `hello`.
    pub client_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipc_socket: default_ipc_socket(),
            bind_policy: BindPolicy::default(),
            client_name: "mediad-cli".to_string(),
        }
    }
}

/// Per-user default endpoint: `unix:///tmp/mediad-ipc-<user>`.
pub fn default_ipc_socket() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("unix:///tmp/mediad-ipc-{user}")
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `MEDIAD_CONFIG_DIR` overrides the platform config dir
    /// (`~/.config/mediad` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("MEDIAD_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("mediad")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config dir, with environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?);
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`, falling back to defaults.
    pub fn load_from(dir: &Path) -> Self {
        match Self::read_file(&dir.join(CONFIG_FILE)) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring config in {}: {e:#}", dir.display());
                Self::default()
            }
        }
    }

    fn read_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(config))
    }

    /// Apply `MEDIAD_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = var("MEDIAD_IPC_SOCKET") {
            self.ipc_socket = socket;
        }

        if let Some(policy) = var("MEDIAD_BIND_POLICY") {
            match policy.parse() {
                Ok(policy) => self.bind_policy = policy,
                Err(e) => log::warn!("Ignoring MEDIAD_BIND_POLICY: {e}"),
            }
        }
    }

    /// Persists the configuration to the config dir.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(tmp.path());
        assert_eq!(config, Config::default());
        assert!(config.ipc_socket.starts_with("unix:///tmp/mediad-ipc-"));
        assert_eq!(config.bind_policy, BindPolicy::AllOrNothing);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            ipc_socket: "tcp://127.0.0.1:9667;unix:///run/mediad.sock".to_string(),
            bind_policy: BindPolicy::BestEffort,
            client_name: "tester".to_string(),
        };
        config.save_to(tmp.path()).unwrap();

        let mode = fs::metadata(tmp.path().join(CONFIG_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Config::load_from(tmp.path()), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{"bind_policy": "best_effort"}"#,
        )
        .unwrap();
        let config = Config::load_from(tmp.path());
        assert_eq!(config.bind_policy, BindPolicy::BestEffort);
        assert_eq!(config.ipc_socket, default_ipc_socket());
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert_eq!(Config::load_from(tmp.path()), Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "MEDIAD_IPC_SOCKET" => Some("tcp://0.0.0.0:9667".to_string()),
            "MEDIAD_BIND_POLICY" => Some("best_effort".to_string()),
            _ => None,
        });
        assert_eq!(config.ipc_socket, "tcp://0.0.0.0:9667");
        assert_eq!(config.bind_policy, BindPolicy::BestEffort);

        config.apply_overrides(|key| (key == "MEDIAD_BIND_POLICY").then(|| "bogus".to_string()));
        assert_eq!(config.bind_policy, BindPolicy::BestEffort);
    }
}
