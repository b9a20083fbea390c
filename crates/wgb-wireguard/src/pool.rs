//! Deterministic tunnel address assignment.
//!
//! Addresses are a pure function of the configured range and an ordinal:
//! ordinal 0 is the server, ordinals `1..=N` are peers in creation order.
//! Nothing is remembered between calls, so a restart that replays the same
//! creation order always lands on the same addresses.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};

/// Ordinal reserved for the server address.
pub const SERVER_ORDINAL: u32 = 0;

/// An IPv4 range that hands out host addresses by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPool {
    network: Ipv4Net,
}

impl AddressPool {
    /// Creates a pool over `network`. Host bits are discarded, so
    /// `10.9.0.7/24` and `10.9.0.0/24` describe the same pool.
    #[must_use]
    pub fn new(network: Ipv4Net) -> Self {
        Self {
            network: network.trunc(),
        }
    }

    /// Parses a pool from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR is invalid or not IPv4.
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let network = cidr
            .trim()
            .parse::<Ipv4Net>()
            .map_err(|e| WireGuardError::InvalidCidr(format!("{cidr}: {e}")))?;
        Ok(Self::new(network))
    }

    /// The underlying network.
    #[must_use]
    pub const fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Prefix length, used for the `Address = a.b.c.d/len` lines.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Number of assignable host addresses.
    ///
    /// Network and broadcast addresses are excluded except for `/31`
    /// (point-to-point, both usable) and `/32` (the single address).
    #[must_use]
    pub fn usable_hosts(&self) -> u32 {
        match self.network.prefix_len() {
            32 => 1,
            31 => 2,
            len => ((1u64 << (32 - u64::from(len))) - 2) as u32,
        }
    }

    fn first_host(&self) -> u32 {
        let base = u32::from(self.network.network());
        if self.network.prefix_len() >= 31 {
            base
        } else {
            base + 1
        }
    }

    /// Returns the address for `ordinal`.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::RangeExhausted`] if the range has no host
    /// for that ordinal.
    pub fn allocate(&self, ordinal: u32) -> Result<Ipv4Addr> {
        let usable = self.usable_hosts();
        if ordinal >= usable {
            return Err(WireGuardError::RangeExhausted {
                range: self.network.to_string(),
                ordinal,
                usable,
            });
        }
        Ok(Ipv4Addr::from(self.first_host() + ordinal))
    }

    /// The server's address (first usable host).
    ///
    /// # Errors
    ///
    /// Fails only for a range with no usable host.
    pub fn server_address(&self) -> Result<Ipv4Addr> {
        self.allocate(SERVER_ORDINAL)
    }

    /// Number of peers the pool can hold next to the server.
    #[must_use]
    pub fn peer_capacity(&self) -> u32 {
        self.usable_hosts().saturating_sub(1)
    }
}

impl FromStr for AddressPool {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}
