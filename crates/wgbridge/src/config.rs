//! Bridge configuration.
//!
//! Every setting has a default, can be overridden from the environment or the
//! command line, and is checked once by [`BridgeConfig::validate`] before any
//! component is built.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wgb_validation::{
    parse_client_list, sanitize_interface_name, sanitize_peer_name, validate_in_range,
    validate_port,
};
use wgb_wireguard::{parse_allowed_ips, AddressPool, AllowedIp};

use crate::error::{BridgeError, Result};

/// Placeholder written into peer configs when no public address is known.
pub const ENDPOINT_PLACEHOLDER: &str = "YOUR_SERVER_IP";

/// Main bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Server interface name, also the stem of its config file.
    pub config_name: String,
    /// UDP port the server listens on.
    pub listen_port: u16,
    /// IPv4 range for the server and its peers.
    pub address_range: String,
    /// Peer names, comma separated, or a bare count.
    pub clients: String,
    /// Public host written into peer configs. Detected when unset.
    pub public_ip: Option<String>,
    /// Directory holding the OpenVPN client config.
    pub openvpn_config_dir: PathBuf,
    /// Directory for the OpenVPN log file.
    pub openvpn_log_dir: PathBuf,
    /// OpenVPN `--verb` level.
    pub openvpn_log_level: Option<u8>,
    /// Extra arguments passed to OpenVPN verbatim.
    pub openvpn_additional_args: Vec<String>,
    /// User and group OpenVPN drops privileges to.
    pub run_as: Option<String>,
    /// Root of keys, peer configs and the server config.
    pub wireguard_dir: PathBuf,
    /// Status document written by the supervisor.
    pub status_file: PathBuf,
    /// Upper bound on waiting for the tunnel interface.
    pub tunnel_timeout_secs: u64,
    /// Supervisor tick.
    pub health_interval_secs: u64,
    /// Age after which the status document counts as stale.
    pub status_max_age_secs: u64,
    /// Routes pushed to peers.
    pub client_allowed_ips: String,
    /// Keepalive written into peer configs.
    pub persistent_keepalive: u16,
    /// Prefix privileged tools with `sudo`.
    pub use_sudo: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            config_name: "wg0".to_string(),
            listen_port: 1195,
            address_range: "10.9.0.0/24".to_string(),
            clients: "client".to_string(),
            public_ip: None,
            openvpn_config_dir: PathBuf::from("/etc/openvpn/config"),
            openvpn_log_dir: PathBuf::from("/var/log/openvpn"),
            openvpn_log_level: None,
            openvpn_additional_args: Vec::new(),
            run_as: None,
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            status_file: PathBuf::from("/run/process_status.json"),
            tunnel_timeout_secs: 60,
            health_interval_secs: 5,
            status_max_age_secs: 15,
            client_allowed_ips: "0.0.0.0/0".to_string(),
            persistent_keepalive: 25,
            use_sudo: false,
        }
    }
}

impl BridgeConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        sanitize_interface_name(&self.config_name)
            .map_err(|e| BridgeError::config(format!("CONFIG_NAME: {e}")))?;

        validate_port("listen_port", self.listen_port)
            .map_err(|e| BridgeError::config(format!("WG_PORT: {e}")))?;

        let pool = self.pool()?;
        if pool.usable_hosts() < 2 {
            return Err(BridgeError::config(format!(
                "WG_ADDRESS_RANGE: {} must have at least 2 host addresses",
                self.address_range
            )));
        }

        let clients = self.client_names()?;
        if (pool.peer_capacity() as usize) < clients.len() {
            let required = clients.len() + 1;
            return Err(BridgeError::config(format!(
                "WG_ADDRESS_RANGE: {} has only {} host addresses but needs {required} (1 server + {} clients)",
                self.address_range,
                pool.usable_hosts(),
                clients.len()
            )));
        }

        if let Some(ref host) = self.public_ip {
            if host.trim().is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(BridgeError::config(format!("PUBLIC_IP: invalid host '{host}'")));
            }
        }

        if let Some(level) = self.openvpn_log_level {
            validate_in_range("openvpn_log_level", u64::from(level), 0, 9)
                .map_err(|e| BridgeError::config(format!("OPENVPN_LOG_LEVEL: {e}")))?;
        }

        if let Some(ref user) = self.run_as {
            sanitize_peer_name(user)
                .map_err(|e| BridgeError::config(format!("BRIDGE_USER: {e}")))?;
        }

        for (name, value) in [
            ("TUNNEL_TIMEOUT", self.tunnel_timeout_secs),
            ("HEALTH_INTERVAL", self.health_interval_secs),
            ("STATUS_MAX_AGE", self.status_max_age_secs),
        ] {
            validate_in_range(name, value, 1, u64::from(u32::MAX))
                .map_err(|e| BridgeError::config(format!("{name}: {e}")))?;
        }

        self.allowed_ips()?;

        Ok(())
    }

    /// The address pool described by `address_range`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the range is not IPv4 CIDR.
    pub fn pool(&self) -> Result<AddressPool> {
        AddressPool::from_cidr(&self.address_range)
            .map_err(|e| BridgeError::config(format!("WG_ADDRESS_RANGE: {e}")))
    }

    /// Configured peer names in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the list is invalid.
    pub fn client_names(&self) -> Result<Vec<String>> {
        parse_client_list(&self.clients)
            .map(|names| names.into_iter().map(|n| n.into_inner()).collect())
            .map_err(|e| BridgeError::config(format!("WG_CLIENTS: {e}")))
    }

    /// Routes pushed to peers, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if any entry is not CIDR.
    pub fn allowed_ips(&self) -> Result<Vec<AllowedIp>> {
        let ips = parse_allowed_ips(&self.client_allowed_ips)
            .map_err(|e| BridgeError::config(format!("WG_CLIENT_ALLOWED_IPS: {e}")))?;
        if ips.is_empty() {
            return Err(BridgeError::config("WG_CLIENT_ALLOWED_IPS: cannot be empty"));
        }
        Ok(ips)
    }

    /// Directory for server and peer key files.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.wireguard_dir.join("keys")
    }

    /// Directory for rendered peer configs.
    #[must_use]
    pub fn clients_dir(&self) -> PathBuf {
        self.wireguard_dir.join("clients")
    }

    /// Path of the rendered server config.
    #[must_use]
    pub fn server_config_path(&self) -> PathBuf {
        self.wireguard_dir.join(format!("{}.conf", self.config_name))
    }

    /// Path of the setup summary written after startup.
    #[must_use]
    pub fn setup_info_path(&self) -> PathBuf {
        self.wireguard_dir.join("setup-info.json")
    }

    /// Path of the store lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.wireguard_dir.join(".bridge.lock")
    }

    /// Path of the marker that asks the supervisor to reload.
    #[must_use]
    pub fn reload_marker_path(&self) -> PathBuf {
        self.wireguard_dir.join(".reload-pending")
    }

    /// Tunnel wait bound.
    #[must_use]
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }

    /// Supervisor tick.
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.config_name, "wg0");
        assert_eq!(config.listen_port, 1195);
        assert_eq!(config.client_names().expect("names"), vec!["client"]);
    }

    #[test]
    fn test_paths_derive_from_wireguard_dir() {
        let config = BridgeConfig {
            wireguard_dir: PathBuf::from("/data/wg"),
            config_name: "bridge0".to_string(),
            ..BridgeConfig::default()
        };
        assert_eq!(config.server_config_path(), PathBuf::from("/data/wg/bridge0.conf"));
        assert_eq!(config.keys_dir(), PathBuf::from("/data/wg/keys"));
        assert_eq!(config.clients_dir(), PathBuf::from("/data/wg/clients"));
        assert_eq!(config.lock_path(), PathBuf::from("/data/wg/.bridge.lock"));
        assert_eq!(
            config.reload_marker_path(),
            PathBuf::from("/data/wg/.reload-pending")
        );
    }

    #[test]
    fn test_invalid_config_name_rejected() {
        let config = BridgeConfig {
            config_name: "wg0; rm".to_string(),
            ..BridgeConfig::default()
        };
        let err = config.validate().expect_err("should fail");
        assert!(err.to_string().contains("CONFIG_NAME"));
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = BridgeConfig {
            listen_port: 0,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_too_small_for_clients() {
        let config = BridgeConfig {
            address_range: "10.9.0.0/30".to_string(),
            clients: "3".to_string(),
            ..BridgeConfig::default()
        };
        let err = config.validate().expect_err("should fail");
        assert!(err.to_string().contains("needs 4"));
    }

    #[test]
    fn test_single_host_range_rejected() {
        let config = BridgeConfig {
            address_range: "10.9.0.1/32".to_string(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ipv6_range_rejected() {
        let config = BridgeConfig {
            address_range: "fd00::/64".to_string(),
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_log_level_bounds() {
        let config = BridgeConfig {
            openvpn_log_level: Some(10),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = BridgeConfig {
            health_interval_secs: 0,
            ..BridgeConfig::default()
        };
        let err = config.validate().expect_err("should fail");
        assert!(err.to_string().contains("HEALTH_INTERVAL"));
    }

    #[test]
    fn test_blank_public_ip_rejected() {
        let config = BridgeConfig {
            public_ip: Some("  ".to_string()),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_ips_list() {
        let config = BridgeConfig {
            client_allowed_ips: "10.8.0.0/24, 192.168.1.0/24".to_string(),
            ..BridgeConfig::default()
        };
        assert_eq!(config.allowed_ips().expect("valid").len(), 2);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: BridgeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }
}
