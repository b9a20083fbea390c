//! Key and config material store.
//!
//! Owns every identity the bridge hands out. Layout under the wireguard dir:
//!
//! ```text
//! keys/private.key            server private key (0600)
//! keys/public.key             server public key  (0644)
//! keys/peers.json             peer manifest, creation order
//! keys/peers/<name>/private.key
//! keys/peers/<name>/public.key
//! clients/<name>.conf         rendered peer configs (0600)
//! ```
//!
//! The manifest order is the peer's ordinal: entry `i` is always assigned
//! `pool.allocate(i + 1)`. New peers are only ever appended.
//!
//! Callers serialise mutations with [`crate::lock::StoreLock`].

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wgb_wireguard::{
    generate_wg_config, AddressPool, AllowedIp, Endpoint, InterfaceConfig, KeyPair, PeerConfig,
    PrivateKey, PublicKey,
};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::persist::{read_optional, write_atomic, MODE_PUBLIC, MODE_SECRET};

const PRIVATE_KEY_FILE: &str = "private.key";
const PUBLIC_KEY_FILE: &str = "public.key";
const MANIFEST_FILE: &str = "peers.json";

/// The server's key pair and address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    keypair: KeyPair,
    address: Ipv4Addr,
}

impl ServerIdentity {
    /// The server key pair.
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// The server public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// The server tunnel address.
    #[must_use]
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }
}

/// One downstream peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Unique, stable name.
    pub name: String,
    /// Position in creation order, starting at 1.
    pub ordinal: u32,
    /// Assigned tunnel address.
    pub address: Ipv4Addr,
    keypair: KeyPair,
}

impl PeerIdentity {
    /// The peer key pair.
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// The peer public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PeerManifest {
    peers: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    address: Ipv4Addr,
    created_at: DateTime<Utc>,
}

/// Persistent store for identities and rendered configs.
#[derive(Debug, Clone)]
pub struct MaterialStore {
    keys_dir: PathBuf,
    clients_dir: PathBuf,
    pool: AddressPool,
    listen_port: u16,
    client_allowed_ips: Vec<AllowedIp>,
    persistent_keepalive: u16,
}

impl MaterialStore {
    /// Creates a store rooted at the configured wireguard dir.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the range or allowed IPs are invalid.
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            keys_dir: config.keys_dir(),
            clients_dir: config.clients_dir(),
            pool: config.pool()?,
            listen_port: config.listen_port,
            client_allowed_ips: config.allowed_ips()?,
            persistent_keepalive: config.persistent_keepalive,
        })
    }

    /// The address pool identities are drawn from.
    #[must_use]
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Loads the server key pair, generating and persisting one if absent.
    ///
    /// An existing pair is never replaced. A private key without its public
    /// half gets the public half re-derived.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted material is unreadable or corrupt, or
    /// if it cannot be written.
    pub fn ensure_server_identity(&self) -> Result<ServerIdentity> {
        let keypair = match load_keypair(&self.keys_dir)? {
            Some(keypair) => {
                info!("using existing server keys");
                keypair
            }
            None => {
                warn!(
                    dir = %self.keys_dir.display(),
                    "no server keys found, generating; previously issued client configs will not match"
                );
                let keypair = KeyPair::generate();
                save_keypair(&self.keys_dir, &keypair)?;
                keypair
            }
        };
        Ok(ServerIdentity {
            keypair,
            address: self.pool.server_address()?,
        })
    }

    /// Loads the server identity without generating anything.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ServerKeysMissing`] if no server private key is
    /// stored, or an error if the stored keys are corrupt.
    pub fn load_server_identity(&self) -> Result<ServerIdentity> {
        let keypair = load_keypair(&self.keys_dir)?
            .ok_or_else(|| BridgeError::ServerKeysMissing(self.keys_dir.clone()))?;
        Ok(ServerIdentity {
            keypair,
            address: self.pool.server_address()?,
        })
    }

    /// Materialises identities for `names` and returns every persisted peer
    /// in creation order.
    ///
    /// Names already in the manifest keep their keys and address. New names
    /// are appended in the order given. Peers added at runtime stay in the
    /// result even when absent from `names`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NameCollision`] if a persisted peer's address
    /// does not match its position, and [`BridgeError::RangeExhausted`] if a
    /// new peer does not fit.
    pub fn ensure_peer_identities(&self, names: &[String]) -> Result<Vec<PeerIdentity>> {
        let mut manifest = self.load_manifest()?;
        self.check_manifest(&manifest)?;

        let mut changed = false;
        for name in names {
            if manifest.peers.iter().any(|p| &p.name == name) {
                continue;
            }
            self.append_entry(&mut manifest, name)?;
            changed = true;
        }
        if changed {
            self.save_manifest(&manifest)?;
        }

        manifest
            .peers
            .iter()
            .zip(1u32..)
            .map(|(entry, ordinal)| {
                let keypair = self.ensure_peer_keypair(&entry.name)?;
                Ok(PeerIdentity {
                    name: entry.name.clone(),
                    ordinal,
                    address: entry.address,
                    keypair,
                })
            })
            .collect()
    }

    /// Appends one peer without touching any existing identity.
    ///
    /// The peer always gets fresh keys. Keys left behind for `name` by an
    /// add that never reached the manifest are discarded, and a failed
    /// manifest write removes the keys this call created.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DuplicateName`] if `name` exists and
    /// [`BridgeError::RangeExhausted`] if the pool is full. Nothing is written
    /// in either case.
    pub fn add_peer(&self, name: &str) -> Result<PeerIdentity> {
        let mut manifest = self.load_manifest()?;
        if manifest.peers.iter().any(|p| p.name == name) {
            return Err(BridgeError::DuplicateName(name.to_string()));
        }
        self.check_manifest(&manifest)?;

        let entry = self.append_entry(&mut manifest, name)?;
        let ordinal = u32::try_from(manifest.peers.len())
            .map_err(|_| BridgeError::config("peer manifest too large"))?;

        let keys_dir = self.peer_keys_dir(name);
        if keys_dir.exists() {
            warn!(peer = %name, dir = %keys_dir.display(), "discarding orphaned peer keys");
            remove_dir_if_exists(&keys_dir)?;
        }
        let keypair = KeyPair::generate();
        let persisted =
            save_keypair(&keys_dir, &keypair).and_then(|()| self.save_manifest(&manifest));
        if let Err(e) = persisted {
            if let Err(cleanup) = remove_dir_if_exists(&keys_dir) {
                warn!(peer = %name, error = %cleanup, "failed to remove keys of unfinished add");
            }
            return Err(e);
        }

        info!(peer = %name, address = %entry.address, "peer added");
        Ok(PeerIdentity {
            name: name.to_string(),
            ordinal,
            address: entry.address,
            keypair,
        })
    }

    /// Loads every persisted peer without creating anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or any key file is missing or corrupt.
    pub fn load_peers(&self) -> Result<Vec<PeerIdentity>> {
        let manifest = self.load_manifest()?;
        self.check_manifest(&manifest)?;
        manifest
            .peers
            .iter()
            .zip(1u32..)
            .map(|(entry, ordinal)| {
                let dir = self.peer_keys_dir(&entry.name);
                let keypair = load_keypair(&dir)?.ok_or_else(|| {
                    BridgeError::io(
                        dir.join(PRIVATE_KEY_FILE),
                        std::io::Error::new(std::io::ErrorKind::NotFound, "peer key missing"),
                    )
                })?;
                Ok(PeerIdentity {
                    name: entry.name.clone(),
                    ordinal,
                    address: entry.address,
                    keypair,
                })
            })
            .collect()
    }

    /// Looks up one persisted peer.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PeerNotFound`] if no such peer exists.
    pub fn peer(&self, name: &str) -> Result<PeerIdentity> {
        self.load_peers()?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| BridgeError::PeerNotFound(name.to_string()))
    }

    /// Renders the server config with forwarding rules bound to
    /// `tunnel_interface`.
    #[must_use]
    pub fn render_server_config(
        &self,
        server: &ServerIdentity,
        peers: &[PeerIdentity],
        tunnel_interface: &str,
    ) -> String {
        let mut config = InterfaceConfig::new(server.keypair.private_key().clone())
            .with_address(self.interface_address(server.address))
            .with_listen_port(self.listen_port);

        for rule in forwarding_rules(tunnel_interface) {
            config = config
                .with_post_up(format!("iptables -A {rule}"))
                .with_post_down(format!("iptables -D {rule}"));
        }
        config = config.with_post_up(format!("iptables -t nat -A {}", nat_rule(tunnel_interface)));
        config = config.with_post_down(format!("iptables -t nat -D {}", nat_rule(tunnel_interface)));

        for peer in peers {
            config = config.with_peer(
                PeerConfig::new(peer.public_key().clone())
                    .with_name(peer.name.clone())
                    .with_allowed_ip(AllowedIp::host(IpAddr::V4(peer.address))),
            );
        }

        generate_wg_config(&config)
    }

    /// Renders the config a peer imports into its client.
    #[must_use]
    pub fn render_peer_config(
        &self,
        peer: &PeerIdentity,
        server: &PublicKey,
        endpoint_host: &str,
    ) -> String {
        let mut server_peer = PeerConfig::new(server.clone())
            .with_endpoint(Endpoint::new(endpoint_host, self.listen_port))
            .with_persistent_keepalive(self.persistent_keepalive);
        for ip in &self.client_allowed_ips {
            server_peer = server_peer.with_allowed_ip(ip.clone());
        }

        let config = InterfaceConfig::new(peer.keypair.private_key().clone())
            .with_address(self.interface_address(peer.address))
            .with_peer(server_peer);

        generate_wg_config(&config)
    }

    /// Writes a rendered peer config to `clients/<name>.conf`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the file cannot be written.
    pub fn write_peer_config(&self, name: &str, rendered: &str) -> Result<PathBuf> {
        let path = self.peer_config_path(name);
        write_atomic(&path, rendered.as_bytes(), MODE_SECRET)?;
        Ok(path)
    }

    /// Reads a previously written peer config.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PeerNotFound`] if no config was written.
    pub fn read_peer_config(&self, name: &str) -> Result<String> {
        read_optional(&self.peer_config_path(name))?
            .ok_or_else(|| BridgeError::PeerNotFound(name.to_string()))
    }

    /// Path of a peer's rendered config.
    #[must_use]
    pub fn peer_config_path(&self, name: &str) -> PathBuf {
        self.clients_dir.join(format!("{name}.conf"))
    }

    fn interface_address(&self, addr: Ipv4Addr) -> AllowedIp {
        let prefix = self.pool.prefix_len();
        // prefix comes from a parsed Ipv4Net so it is always <= 32
        ipnet::Ipv4Net::new(addr, prefix)
            .map(|net| AllowedIp::new(net.into()))
            .unwrap_or_else(|_| AllowedIp::host(IpAddr::V4(addr)))
    }

    fn peer_keys_dir(&self, name: &str) -> PathBuf {
        self.keys_dir.join("peers").join(name)
    }

    fn manifest_path(&self) -> PathBuf {
        self.keys_dir.join(MANIFEST_FILE)
    }

    fn load_manifest(&self) -> Result<PeerManifest> {
        match read_optional(&self.manifest_path())? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(PeerManifest::default()),
        }
    }

    fn save_manifest(&self, manifest: &PeerManifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        write_atomic(&self.manifest_path(), json.as_bytes(), MODE_SECRET)
    }

    fn check_manifest(&self, manifest: &PeerManifest) -> Result<()> {
        for (entry, ordinal) in manifest.peers.iter().zip(1u32..) {
            let expected = self.pool.allocate(ordinal)?;
            if entry.address != expected {
                return Err(BridgeError::NameCollision {
                    name: entry.name.clone(),
                    persisted: entry.address.to_string(),
                    expected: expected.to_string(),
                });
            }
        }
        Ok(())
    }

    fn append_entry(&self, manifest: &mut PeerManifest, name: &str) -> Result<ManifestEntry> {
        let ordinal = u32::try_from(manifest.peers.len() + 1)
            .map_err(|_| BridgeError::config("peer manifest too large"))?;
        let entry = ManifestEntry {
            name: name.to_string(),
            address: self.pool.allocate(ordinal)?,
            created_at: Utc::now(),
        };
        manifest.peers.push(entry.clone());
        Ok(entry)
    }

    fn ensure_peer_keypair(&self, name: &str) -> Result<KeyPair> {
        let dir = self.peer_keys_dir(name);
        if let Some(keypair) = load_keypair(&dir)? {
            return Ok(keypair);
        }
        info!(peer = %name, "generating peer keys");
        let keypair = KeyPair::generate();
        save_keypair(&dir, &keypair)?;
        Ok(keypair)
    }
}

fn forwarding_rules(tunnel: &str) -> [String; 2] {
    [
        format!("FORWARD -i %i -o {tunnel} -j ACCEPT"),
        format!("FORWARD -i {tunnel} -o %i -m state --state RELATED,ESTABLISHED -j ACCEPT"),
    ]
}

fn nat_rule(tunnel: &str) -> String {
    format!("POSTROUTING -o {tunnel} -j MASQUERADE")
}

fn load_keypair(dir: &Path) -> Result<Option<KeyPair>> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);

    let Some(private) = read_optional(&private_path)? else {
        return Ok(None);
    };
    let private = PrivateKey::from_base64(private.trim())?;

    match read_optional(&public_path)? {
        Some(public) => Ok(Some(KeyPair::from_base64_pair(
            &private.to_base64(),
            public.trim(),
        )?)),
        None => {
            warn!(path = %public_path.display(), "public key missing, re-deriving");
            let keypair = KeyPair::from_private_key(private);
            let encoded = format!("{}\n", keypair.public_key().to_base64());
            write_atomic(&public_path, encoded.as_bytes(), MODE_PUBLIC)?;
            Ok(Some(keypair))
        }
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BridgeError::io(dir, e)),
    }
}

fn save_keypair(dir: &Path, keypair: &KeyPair) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| BridgeError::io(dir, e))?;
    let private = format!("{}\n", keypair.private_key().to_base64());
    let public = format!("{}\n", keypair.public_key().to_base64());
    write_atomic(&dir.join(PRIVATE_KEY_FILE), private.as_bytes(), MODE_SECRET)?;
    write_atomic(&dir.join(PUBLIC_KEY_FILE), public.as_bytes(), MODE_PUBLIC)
}
