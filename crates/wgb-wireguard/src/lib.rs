//! WireGuard building blocks for the bridge.
//!
//! Curve25519 key types, the deterministic address pool that hands out
//! tunnel addresses, and the INI-style configuration model consumed by
//! `wg-quick`.

pub mod config;
pub mod error;
mod keys;
pub mod pool;
pub mod types;

pub use config::{generate_wg_config, parse_wg_config, InterfaceConfig, PeerConfig};
pub use error::{Result, WireGuardError};
pub use keys::{KeyPair, PrivateKey, PublicKey, KEY_SIZE};
pub use pool::AddressPool;
pub use types::{parse_allowed_ips, AllowedIp, Endpoint};
