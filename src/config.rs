//! Server settings, loaded from and saved to a JSON document.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server settings. Every field has a default so partial config files keep
/// working; keys are camelCase in the JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub server_name: String,
    pub server_port: u16,
    /// Shared secret presented by clients as the connect handshake payload.
    pub connection_key: String,
    pub max_players: usize,
    /// Polling loop frequency; the tick interval is `1000 / tick_rate` ms.
    pub tick_rate: u32,
    pub disconnect_timeout_ms: u64,
    pub enable_upnp: bool,
    pub enable_heartbeat: bool,
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server_name: "Game Server".to_string(),
            server_port: 7777,
            connection_key: "default_key".to_string(),
            max_players: 10,
            tick_rate: 60,
            disconnect_timeout_ms: 5000,
            enable_upnp: true,
            enable_heartbeat: true,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Load from `path`, creating and saving a default config when the file
    /// does not exist.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!(
                "config file {} not found, creating defaults",
                path.display()
            );
            let config = ServerConfig::default();
            config.save_to_file(path)?;
            return Ok(config);
        }
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }
}
