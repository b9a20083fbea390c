//! Core value types for `WireGuard` configuration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};

/// An allowed IP address or network in CIDR notation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedIp { network: IpNet }

impl AllowedIp {
    /// Creates a new allowed IP from an `IpNet`.
    #[must_use]
    pub fn new(network: IpNet) -> Self { Self { network } }

    /// A single-host entry (`/32` or `/128`).
    #[must_use]
    pub fn host(addr: IpAddr) -> Self { Self { network: IpNet::from(addr) } }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet { &self.network }

    /// Creates an allowed IP from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self> {
        let network = s.trim().parse::<IpNet>().map_err(|e| WireGuardError::InvalidCidr(format!("{s}: {e}")))?;
        Ok(Self { network })
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String { self.network.to_string() }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> { Self::from_cidr(s) }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.network) }
}

/// Parses a comma-separated CIDR list such as `0.0.0.0/0, ::/0`.
///
/// # Errors
///
/// Returns an error if any entry is not valid CIDR notation.
pub fn parse_allowed_ips(list: &str) -> Result<Vec<AllowedIp>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(AllowedIp::from_cidr)
        .collect()
}

/// A `WireGuard` peer endpoint.
///
/// The host is kept as text: it may be an IP literal, a DNS name, or a
/// placeholder an operator is expected to fill in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Returns the host part.
    #[must_use]
    pub fn host(&self) -> &str { &self.host }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 { self.port }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireGuardError::InvalidEndpoint(format!("missing port: {s}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(WireGuardError::InvalidEndpoint(format!("missing host: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| WireGuardError::InvalidEndpoint(format!("{s}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_entry_is_single_address() {
        let ip = AllowedIp::host("10.9.0.2".parse().expect("ip"));
        assert_eq!(ip.to_cidr(), "10.9.0.2/32");
    }

    #[test]
    fn parse_allowed_ips_list() {
        let ips = parse_allowed_ips("0.0.0.0/0, ::/0").expect("valid");
        assert_eq!(ips.len(), 2);
        assert!(parse_allowed_ips("10.0.0.0/33").is_err());
    }

    #[test]
    fn endpoint_with_hostname() {
        let ep: Endpoint = "vpn.example.com:1195".parse().expect("valid");
        assert_eq!(ep.host(), "vpn.example.com");
        assert_eq!(ep.port(), 1195);
        assert_eq!(ep.to_string(), "vpn.example.com:1195");
    }

    #[test]
    fn endpoint_with_ipv6_is_bracketed() {
        let ep: Endpoint = "[2001:db8::1]:51820".parse().expect("valid");
        assert_eq!(ep.host(), "2001:db8::1");
        assert_eq!(ep.to_string(), "[2001:db8::1]:51820");
    }

    #[test]
    fn endpoint_without_port_rejected() {
        assert!("vpn.example.com".parse::<Endpoint>().is_err());
        assert!(":1195".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }
}
