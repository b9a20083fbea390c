//! `WireGuard` configuration file generation and parsing.
//!
//! This module handles the INI-style format consumed by `wg-quick`. Output is
//! deterministic: the same inputs always render byte-identical text, which
//! lets callers compare a freshly rendered config with the one on disk.

use std::fmt::Write as FmtWrite;

use crate::error::{Result, WireGuardError};
use crate::keys::{PrivateKey, PublicKey};
use crate::types::{AllowedIp, Endpoint};

/// The `[Interface]` section plus every `[Peer]` that follows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// The interface's private key.
    pub private_key: PrivateKey,
    /// Optional listen port.
    pub listen_port: Option<u16>,
    /// Addresses assigned to this interface. Host bits are kept, so
    /// `10.9.0.1/24` renders as written.
    pub addresses: Vec<AllowedIp>,
    /// `PostUp` hooks, rendered one line each in order.
    pub post_up: Vec<String>,
    /// `PostDown` hooks, rendered one line each in order.
    pub post_down: Vec<String>,
    /// Configured peers.
    pub peers: Vec<PeerConfig>,
}

impl InterfaceConfig {
    /// Creates a new interface configuration with the given private key.
    #[must_use]
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            listen_port: None,
            addresses: Vec::new(),
            post_up: Vec::new(),
            post_down: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds an address.
    #[must_use]
    pub fn with_address(mut self, address: AllowedIp) -> Self {
        self.addresses.push(address);
        self
    }

    /// Adds a `PostUp` hook.
    #[must_use]
    pub fn with_post_up(mut self, command: impl Into<String>) -> Self {
        self.post_up.push(command.into());
        self
    }

    /// Adds a `PostDown` hook.
    #[must_use]
    pub fn with_post_down(mut self, command: impl Into<String>) -> Self {
        self.post_down.push(command.into());
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }
}

/// A `[Peer]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// Label written as a `# name` comment on the line after `[Peer]`.
    pub name: Option<String>,
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Allowed IPs for this peer.
    pub allowed_ips: Vec<AllowedIp>,
    /// Optional endpoint.
    pub endpoint: Option<Endpoint>,
    /// Optional persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Creates a new peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            name: None,
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// Sets the comment label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }
}

/// Generates a `WireGuard` configuration file from an `InterfaceConfig`.
#[must_use]
pub fn generate_wg_config(config: &InterfaceConfig) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");

    if !config.addresses.is_empty() {
        let addrs: Vec<String> = config.addresses.iter().map(AllowedIp::to_cidr).collect();
        let _ = writeln!(output, "Address = {}", addrs.join(", "));
    }

    if let Some(port) = config.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }

    let _ = writeln!(output, "PrivateKey = {}", config.private_key.to_base64());

    for hook in &config.post_up {
        let _ = writeln!(output, "PostUp = {hook}");
    }
    for hook in &config.post_down {
        let _ = writeln!(output, "PostDown = {hook}");
    }

    for peer in &config.peers {
        output.push('\n');
        output.push_str("[Peer]\n");

        if let Some(ref name) = peer.name {
            let _ = writeln!(output, "# {name}");
        }

        let _ = writeln!(output, "PublicKey = {}", peer.public_key.to_base64());

        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }

        if !peer.allowed_ips.is_empty() {
            let ips: Vec<String> = peer.allowed_ips.iter().map(AllowedIp::to_cidr).collect();
            let _ = writeln!(output, "AllowedIPs = {}", ips.join(", "));
        }

        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(output, "PersistentKeepalive = {keepalive}");
        }
    }

    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

fn parse_error(line: usize, message: impl Into<String>) -> WireGuardError {
    WireGuardError::ParseError {
        line,
        message: message.into(),
    }
}

fn parse_cidr_list(value: &str, key: &str, line: usize, into: &mut Vec<AllowedIp>) -> Result<()> {
    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        into.push(
            AllowedIp::from_cidr(entry)
                .map_err(|_| parse_error(line, format!("invalid {key}: {entry}")))?,
        );
    }
    Ok(())
}

/// Parses a `WireGuard` configuration file.
///
/// Unknown keys are ignored so that files carrying `wg-quick` extensions
/// (`DNS`, `Table`, ...) still load. A comment directly after `[Peer]`
/// becomes that peer's name.
///
/// # Errors
///
/// Returns [`WireGuardError::ParseError`] for unknown sections, malformed
/// lines, invalid values, or a missing `PrivateKey`/`PublicKey`.
pub fn parse_wg_config(config_str: &str) -> Result<InterfaceConfig> {
    let mut section = Section::None;
    let mut private_key: Option<PrivateKey> = None;
    let mut listen_port: Option<u16> = None;
    let mut addresses = Vec::new();
    let mut post_up = Vec::new();
    let mut post_down = Vec::new();
    let mut peers: Vec<PeerConfig> = Vec::new();
    let mut current_peer: Option<ParsedPeer> = None;

    for (idx, raw) in config_str.lines().enumerate() {
        let line = raw.trim();
        let line_number = idx + 1;

        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            if let Some(peer) = current_peer.as_mut() {
                if peer.is_empty() {
                    peer.name = Some(comment.trim().to_string());
                }
            }
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if let Some(peer) = current_peer.take() {
                peers.push(peer.build(line_number)?);
            }

            let section_name = &line[1..line.len() - 1];
            section = match section_name {
                "Interface" => Section::Interface,
                "Peer" => {
                    current_peer = Some(ParsedPeer::default());
                    Section::Peer
                }
                _ => {
                    return Err(parse_error(
                        line_number,
                        format!("unknown section: {section_name}"),
                    ));
                }
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(line_number, format!("invalid line format: {line}")));
        };
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::None => {
                return Err(parse_error(line_number, "key-value pair outside of section"));
            }
            Section::Interface => match key {
                "PrivateKey" => {
                    private_key = Some(
                        PrivateKey::from_base64(value)
                            .map_err(|_| parse_error(line_number, "invalid PrivateKey"))?,
                    );
                }
                "ListenPort" => {
                    listen_port = Some(
                        value
                            .parse()
                            .map_err(|_| parse_error(line_number, "invalid ListenPort"))?,
                    );
                }
                "Address" => parse_cidr_list(value, "Address", line_number, &mut addresses)?,
                "PostUp" => post_up.push(value.to_string()),
                "PostDown" => post_down.push(value.to_string()),
                _ => {}
            },
            Section::Peer => {
                if let Some(ref mut peer) = current_peer {
                    peer.parse_key(key, value, line_number)?;
                }
            }
        }
    }

    if let Some(peer) = current_peer {
        let last_line = config_str.lines().count();
        peers.push(peer.build(last_line)?);
    }

    let private_key =
        private_key.ok_or_else(|| parse_error(0, "missing PrivateKey in [Interface] section"))?;

    Ok(InterfaceConfig {
        private_key,
        listen_port,
        addresses,
        post_up,
        post_down,
        peers,
    })
}

#[derive(Default)]
struct ParsedPeer {
    name: Option<String>,
    public_key: Option<PublicKey>,
    allowed_ips: Vec<AllowedIp>,
    endpoint: Option<Endpoint>,
    persistent_keepalive: Option<u16>,
    seen_key: bool,
}

impl ParsedPeer {
    fn is_empty(&self) -> bool {
        self.name.is_none() && !self.seen_key
    }

    fn parse_key(&mut self, key: &str, value: &str, line_number: usize) -> Result<()> {
        self.seen_key = true;
        match key {
            "PublicKey" => {
                self.public_key = Some(
                    PublicKey::from_base64(value)
                        .map_err(|_| parse_error(line_number, "invalid PublicKey"))?,
                );
            }
            "AllowedIPs" => parse_cidr_list(value, "AllowedIPs", line_number, &mut self.allowed_ips)?,
            "Endpoint" => {
                self.endpoint = Some(
                    value
                        .parse()
                        .map_err(|_| parse_error(line_number, format!("invalid Endpoint: {value}")))?,
                );
            }
            "PersistentKeepalive" => {
                self.persistent_keepalive = Some(
                    value
                        .parse()
                        .map_err(|_| parse_error(line_number, "invalid PersistentKeepalive"))?,
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn build(self, line_number: usize) -> Result<PeerConfig> {
        let public_key = self
            .public_key
            .ok_or_else(|| parse_error(line_number, "missing PublicKey in [Peer] section"))?;

        Ok(PeerConfig {
            name: self.name,
            public_key,
            allowed_ips: self.allowed_ips,
            endpoint: self.endpoint,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}
