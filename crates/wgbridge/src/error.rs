//! Error types for the bridge.
//!
//! Failures fall into three groups that callers treat differently: user input
//! errors from the admin path, conditions that are fatal during startup, and
//! everything else, which the supervisor logs and retries.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use wgb_validation::{CommandError, ValidationError};
use wgb_wireguard::WireGuardError;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while running the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The legacy config directory holds no recognised client config.
    #[error("no OpenVPN config found in {dir} (looked for *.ovpn, *.conf)")]
    NoConfigFound {
        /// Directory that was scanned.
        dir: PathBuf,
    },

    /// No tunnel interface appeared in time.
    #[error("tunnel interface did not appear within {timeout_secs} seconds")]
    TunnelTimeout {
        /// How long we waited.
        timeout_secs: u64,
    },

    /// Bringing the server interface up failed.
    #[error("failed to activate {interface}: {reason}")]
    Activation {
        /// The interface that failed.
        interface: String,
        /// What the tool reported.
        reason: String,
    },

    /// The address range has no room for another identity.
    #[error("address range {range} exhausted: {usable} usable hosts, ordinal {ordinal} requested")]
    RangeExhausted {
        /// The configured range.
        range: String,
        /// The ordinal that did not fit.
        ordinal: u32,
        /// Usable hosts in the range.
        usable: u32,
    },

    /// A persisted peer disagrees with the address its position implies.
    #[error("peer '{name}' is persisted with address {persisted} but its position maps to {expected}")]
    NameCollision {
        /// The peer name.
        name: String,
        /// Address recorded on disk.
        persisted: String,
        /// Address the pool assigns to that position.
        expected: String,
    },

    /// A peer with this name already exists.
    #[error("client '{0}' already exists")]
    DuplicateName(String),

    /// A peer name failed validation.
    #[error("invalid client name: {0}")]
    InvalidName(ValidationError),

    /// No peer with this name exists.
    #[error("client '{0}' not found")]
    PeerNotFound(String),

    /// The bridge has not completed a first startup yet.
    #[error("setup info not found at {0}; start the bridge before managing clients")]
    SetupInfoMissing(PathBuf),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error with the path involved.
    #[error("io error on {path}: {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialisation failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An external tool failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Key, address or config material was invalid.
    #[error("wireguard error: {0}")]
    WireGuard(WireGuardError),

    /// The store lock could not be taken.
    #[error("could not acquire lock {path} within {waited_ms} ms")]
    Lock {
        /// The lock file.
        path: PathBuf,
        /// How long we waited.
        waited_ms: u64,
    },

    /// Public endpoint detection failed.
    #[error("endpoint detection failed: {0}")]
    Endpoint(String),

    /// Shutdown was requested before startup finished.
    #[error("interrupted by shutdown request")]
    Interrupted,

    /// The server keys are absent from the store.
    #[error("server keys missing from {0}; restart the bridge to regenerate them")]
    ServerKeysMissing(PathBuf),
}

impl BridgeError {
    /// Creates an `Io` error for `path`.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an `Activation` error.
    #[must_use]
    pub fn activation(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Activation {
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true for errors caused by the admin caller's input. These are
    /// reported back without any state having changed.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName(_)
                | Self::InvalidName(_)
                | Self::RangeExhausted { .. }
                | Self::PeerNotFound(_)
        )
    }

    /// Returns true for errors that must abort startup.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::NoConfigFound { .. }
                | Self::TunnelTimeout { .. }
                | Self::Activation { .. }
                | Self::NameCollision { .. }
        )
    }
}

impl From<WireGuardError> for BridgeError {
    fn from(err: WireGuardError) -> Self {
        match err {
            WireGuardError::RangeExhausted {
                range,
                ordinal,
                usable,
            } => Self::RangeExhausted {
                range,
                ordinal,
                usable,
            },
            other => Self::WireGuard(other),
        }
    }
}

/// The ordered startup phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Host forwarding setup.
    Infrastructure,
    /// Legacy client start and tunnel discovery.
    LegacyTunnel,
    /// Key and peer identity materialisation.
    Identities,
    /// Server configuration and activation.
    ModernServer,
}

impl Phase {
    /// Position of the phase in the startup order, starting at 1.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Infrastructure => 1,
            Self::LegacyTunnel => 2,
            Self::Identities => 3,
            Self::ModernServer => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Infrastructure => "infrastructure",
            Self::LegacyTunnel => "legacy tunnel",
            Self::Identities => "identities",
            Self::ModernServer => "modern server",
        };
        write!(f, "{name}")
    }
}

/// A startup failure tagged with the phase it happened in.
#[derive(Debug, Error)]
#[error("startup phase {} ({phase}) failed: {source}", .phase.number())]
pub struct StartupError {
    /// The failing phase.
    pub phase: Phase,
    /// What went wrong.
    #[source]
    pub source: BridgeError,
}

impl StartupError {
    /// Wraps `source` as a failure of `phase`.
    #[must_use]
    pub fn new(phase: Phase, source: BridgeError) -> Self {
        Self { phase, source }
    }
}
