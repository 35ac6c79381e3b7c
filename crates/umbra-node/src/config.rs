//! Node configuration file management.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use umbra_tunnel::TunnelSettings;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP address the tunnel community binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Hex-encoded 32-byte long-term secret. Empty = fresh key each start
    /// (the core persists nothing by itself).
    #[serde(default)]
    pub identity_key: String,
    /// Static peers standing in for the gossip substrate.
    #[serde(default)]
    pub bootstrap: Vec<BootstrapPeer>,
    /// Tunnel core knobs.
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Log filter, overridable via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// UDP socket address.
    pub addr: String,
    /// Hex-encoded 32-byte long-term public key.
    pub public_key: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:21000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            identity_key: String::new(),
            bootstrap: Vec::new(),
            tunnel: TunnelSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load from an explicit path, the `UMBRA_CONFIG` env var, or defaults
    /// when neither names an existing file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => Some(PathBuf::from(p)),
            None => std::env::var("UMBRA_CONFIG").ok().map(PathBuf::from),
        };
        match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                Ok(toml::from_str(&content)?)
            }
            Some(p) => anyhow::bail!("config file {} does not exist", p.display()),
            None => Ok(Self::default()),
        }
    }
}
