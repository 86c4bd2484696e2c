// Configuration for the connectivity core
//
// Stored as JSON. Default data location:
// - Linux: ~/.local/share/swarmlink
// - macOS: ~/Library/Application Support/swarmlink
// - Windows: %LOCALAPPDATA%\swarmlink

use crate::relay::{PeerConnectionMode, RelayTransportParams, DEFAULT_TURN_PORT};
use crate::routing::DEFAULT_BUCKET_MAX_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

const APP_DIR: &str = "swarmlink";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root for per-account data. Falls back to the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Routing table settings
    pub routing: RoutingConfig,

    /// TURN relay, if the account has one
    pub relay: Option<RelayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Live links kept per bucket
    pub bucket_max_size: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bucket_max_size: DEFAULT_BUCKET_MAX_SIZE,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host name or IP address of the TURN server
    pub server: String,

    /// Server port, 3478 when absent
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub realm: String,

    pub username: String,

    pub password: String,

    #[serde(default)]
    pub peer_connection_mode: PeerConnectionMode,

    /// Give up on a never-ready allocation after this many seconds
    #[serde(default = "default_allocation_timeout_secs")]
    pub allocation_timeout_secs: u64,

    /// Polling task tick in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_allocation_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    10
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("server", &self.server)
            .field("port", &self.port.unwrap_or(DEFAULT_TURN_PORT))
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("peer_connection_mode", &self.peer_connection_mode)
            .finish()
    }
}

impl RelayConfig {
    /// Build transport parameters from this configuration
    pub fn to_params(&self) -> RelayTransportParams {
        RelayTransportParams {
            server: self.server.clone(),
            port: self.port,
            realm: self.realm.clone(),
            username: self.username.clone(),
            password: Zeroizing::new(self.password.clone()),
            peer_connection_mode: self.peer_connection_mode,
            allocation_timeout: Duration::from_secs(self.allocation_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            ..RelayTransportParams::default()
        }
    }
}

impl CoreConfig {
    /// Platform data directory for the core
    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join(APP_DIR);
        Ok(data_dir)
    }

    /// Effective data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_data_dir(),
        }
    }

    /// Per-account directory, created if missing
    pub fn account_dir(&self, account_id: &str) -> Result<PathBuf> {
        if account_id.is_empty() || account_id.contains(['/', '\\']) || account_id.starts_with('.') {
            anyhow::bail!("Invalid account id: {:?}", account_id);
        }
        let dir = self.data_dir()?.join(account_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create account directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Load config from `path`, writing defaults if the file does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: CoreConfig = serde_json::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = CoreConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = CoreConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.routing.bucket_max_size, DEFAULT_BUCKET_MAX_SIZE);
        assert!(config.relay.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = CoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            routing: RoutingConfig { bucket_max_size: 8 },
            relay: Some(RelayConfig {
                server: "turn.example.net".to_string(),
                port: None,
                realm: "example.net".to_string(),
                username: "alice".to_string(),
                password: "secret".to_string(),
                peer_connection_mode: PeerConnectionMode::Tcp,
                allocation_timeout_secs: 5,
                poll_interval_ms: 10,
            }),
        };
        config.save(&path).unwrap();

        let loaded = CoreConfig::load(&path).unwrap();
        assert_eq!(loaded.routing.bucket_max_size, 8);
        let relay = loaded.relay.unwrap();
        assert_eq!(relay.peer_connection_mode, PeerConnectionMode::Tcp);

        let params = relay.to_params();
        assert_eq!(params.server_port(), DEFAULT_TURN_PORT);
        assert_eq!(params.allocation_timeout, Duration::from_secs(5));
        assert_eq!(params.password.as_str(), "secret");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"relay":{"server":"10.0.0.1","username":"u","password":"p"}}"#,
        )
        .unwrap();

        let config = CoreConfig::load(&path).unwrap();
        let relay = config.relay.unwrap();
        assert_eq!(relay.peer_connection_mode, PeerConnectionMode::Udp);
        assert_eq!(relay.allocation_timeout_secs, 30);
        assert_eq!(config.routing.bucket_max_size, DEFAULT_BUCKET_MAX_SIZE);
    }

    #[test]
    fn test_account_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..CoreConfig::default()
        };
        let account = config.account_dir("a1b2").unwrap();
        assert!(account.is_dir());
        assert!(config.account_dir("../oops").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let relay = RelayConfig {
            server: "s".to_string(),
            port: Some(5349),
            realm: String::new(),
            username: "u".to_string(),
            password: "hunter2".to_string(),
            peer_connection_mode: PeerConnectionMode::Udp,
            allocation_timeout_secs: 30,
            poll_interval_ms: 10,
        };
        assert!(!format!("{:?}", relay).contains("hunter2"));
    }
}
