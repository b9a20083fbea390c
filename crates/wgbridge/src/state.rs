//! In-process bridge state and the setup summary persisted next to it.
//!
//! The supervisor works from [`BridgeState`]; the filesystem is only read at
//! boot and when another process signals a change.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BridgeError, Result};
use crate::legacy::TunnelInfo;
use crate::persist::{read_optional, write_atomic, MODE_PUBLIC};
use crate::store::{PeerIdentity, ServerIdentity};

/// Everything the running bridge knows.
#[derive(Debug, Clone)]
pub struct BridgeState {
    /// The server identity.
    pub server: ServerIdentity,
    /// Peers in creation order.
    pub peers: Vec<PeerIdentity>,
    /// Current upstream tunnel.
    pub tunnel: TunnelInfo,
    /// Tunnel interface named by the forwarding rules the server last
    /// accepted. Differs from `tunnel.interface` until a rebind succeeds.
    pub bound_tunnel: String,
    /// Host peers dial.
    pub endpoint: String,
    /// Server config last handed to the server controller.
    pub rendered_server_config: String,
    /// Last time the legacy client probed alive.
    pub tunnel_last_alive: Option<DateTime<Utc>>,
    /// Last time the server probed alive.
    pub server_last_alive: Option<DateTime<Utc>>,
}

/// Shared handle to the bridge state.
pub type SharedState = Arc<RwLock<BridgeState>>;

/// Summary written after identities are materialised. The admin path reads
/// it instead of re-detecting the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupInfo {
    /// Server interface name.
    pub config_name: String,
    /// Server listen port.
    pub listen_port: u16,
    /// Upstream tunnel interface at the time of writing.
    pub tunnel_interface: String,
    /// Server public key, base64.
    pub server_public_key: String,
    /// Host peers dial.
    pub endpoint: String,
    /// Address range.
    pub address_range: String,
}

impl SetupInfo {
    /// Writes the summary to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes(), MODE_PUBLIC)
    }

    /// Reads the summary from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SetupInfoMissing`] if the bridge never
    /// completed startup.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            read_optional(path)?.ok_or_else(|| BridgeError::SetupInfoMissing(path.to_path_buf()))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_setup_info_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("setup-info.json");
        let info = SetupInfo {
            config_name: "wg0".to_string(),
            listen_port: 1195,
            tunnel_interface: "tun0".to_string(),
            server_public_key: "pub".to_string(),
            endpoint: "203.0.113.7".to_string(),
            address_range: "10.9.0.0/24".to_string(),
        };
        info.save(&path).expect("save");
        assert_eq!(SetupInfo::load(&path).expect("load"), info);
    }

    #[test]
    fn test_setup_info_missing() {
        let dir = TempDir::new().expect("tempdir");
        let err = SetupInfo::load(&dir.path().join("setup-info.json")).expect_err("missing");
        assert!(matches!(err, BridgeError::SetupInfoMissing(_)));
    }
}
