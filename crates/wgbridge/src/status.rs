//! Status document shared with the out-of-process health probe.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::legacy::ClientState;
use crate::persist::{read_optional, write_atomic, MODE_PUBLIC};
use crate::server::ServerState;

/// Legacy client section of the status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    /// Client lifecycle state.
    pub state: ClientState,
    /// Result of the last liveness probe.
    pub alive: bool,
    /// Discovered tunnel interface.
    pub interface: Option<String>,
    /// Client process id.
    pub pid: Option<u32>,
    /// Last time the probe succeeded.
    pub last_alive: Option<DateTime<Utc>>,
}

/// Server section of the status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Server lifecycle state.
    pub state: ServerState,
    /// Result of the last liveness probe.
    pub alive: bool,
    /// Server interface name.
    pub interface: String,
    /// Last time the probe succeeded.
    pub last_alive: Option<DateTime<Utc>>,
}

/// Written by the supervisor every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    /// When the document was written.
    pub updated_at: DateTime<Utc>,
    /// Legacy client status.
    pub tunnel: TunnelStatus,
    /// Server status.
    pub server: ServerStatus,
    /// Number of configured peers.
    pub peers: usize,
}

impl StatusDocument {
    /// True when both components were alive at the last probe.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.tunnel.alive && self.server.alive
    }
}

/// Writes the status document atomically.
///
/// # Errors
///
/// Returns an error if serialisation or the write fails.
pub fn write_status(path: &Path, doc: &StatusDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    write_atomic(path, json.as_bytes(), MODE_PUBLIC)
}

/// Reads the status document, `None` if it was never written.
///
/// # Errors
///
/// Returns an error if the file is unreadable or not a status document.
pub fn read_status(path: &Path) -> Result<Option<StatusDocument>> {
    match read_optional(path)? {
        Some(content) => Ok(Some(serde_json::from_str(&content)?)),
        None => Ok(None),
    }
}

/// Outcome of the health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Both components alive and the document is fresh.
    Healthy,
    /// No status document.
    Missing,
    /// The supervisor stopped writing.
    Stale {
        /// Document age in seconds.
        age_secs: i64,
    },
    /// At least one component is down.
    Unhealthy {
        /// Legacy client alive.
        tunnel_alive: bool,
        /// Server alive.
        server_alive: bool,
    },
    /// The document could not be read.
    Unreadable(String),
}

impl HealthVerdict {
    /// True only for [`HealthVerdict::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Missing => write!(f, "status file not found"),
            Self::Stale { age_secs } => write!(f, "status file is stale ({age_secs}s old)"),
            Self::Unhealthy {
                tunnel_alive,
                server_alive,
            } => write!(
                f,
                "unhealthy (openvpn alive: {tunnel_alive}, wireguard alive: {server_alive})"
            ),
            Self::Unreadable(reason) => write!(f, "status file unreadable: {reason}"),
        }
    }
}

/// Evaluates the status document at `path` against `now`.
#[must_use]
pub fn evaluate(path: &Path, max_age: Duration, now: DateTime<Utc>) -> HealthVerdict {
    let doc = match read_status(path) {
        Ok(Some(doc)) => doc,
        Ok(None) => return HealthVerdict::Missing,
        Err(e) => return HealthVerdict::Unreadable(e.to_string()),
    };

    let age_secs = (now - doc.updated_at).num_seconds();
    let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    if age_secs > max_age_secs {
        return HealthVerdict::Stale { age_secs };
    }

    if doc.is_healthy() {
        HealthVerdict::Healthy
    } else {
        HealthVerdict::Unhealthy {
            tunnel_alive: doc.tunnel.alive,
            server_alive: doc.server.alive,
        }
    }
}

/// Health probe for the container runtime.
#[must_use]
pub fn health_check(path: &Path, max_age: Duration) -> HealthVerdict {
    evaluate(path, max_age, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc(updated_at: DateTime<Utc>, tunnel_alive: bool, server_alive: bool) -> StatusDocument {
        StatusDocument {
            updated_at,
            tunnel: TunnelStatus {
                state: if tunnel_alive {
                    ClientState::Connected
                } else {
                    ClientState::Failed
                },
                alive: tunnel_alive,
                interface: Some("tun0".to_string()),
                pid: Some(42),
                last_alive: Some(updated_at),
            },
            server: ServerStatus {
                state: if server_alive {
                    ServerState::Up
                } else {
                    ServerState::Down
                },
                alive: server_alive,
                interface: "wg0".to_string(),
                last_alive: Some(updated_at),
            },
            peers: 2,
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        let verdict = health_check(&dir.path().join("status.json"), Duration::from_secs(15));
        assert_eq!(verdict, HealthVerdict::Missing);
        assert!(!verdict.is_healthy());
    }

    #[test]
    fn test_fresh_and_alive_is_healthy() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("status.json");
        write_status(&path, &doc(Utc::now(), true, true)).expect("write");
        assert!(health_check(&path, Duration::from_secs(15)).is_healthy());
    }

    #[test]
    fn test_stale_document() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("status.json");
        let written = Utc::now();
        write_status(&path, &doc(written, true, true)).expect("write");
        let later = written + chrono::Duration::seconds(30);
        assert_eq!(
            evaluate(&path, Duration::from_secs(15), later),
            HealthVerdict::Stale { age_secs: 30 }
        );
    }

    #[test]
    fn test_dead_component_is_unhealthy() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("status.json");
        write_status(&path, &doc(Utc::now(), true, false)).expect("write");
        let verdict = health_check(&path, Duration::from_secs(15));
        assert_eq!(
            verdict,
            HealthVerdict::Unhealthy {
                tunnel_alive: true,
                server_alive: false
            }
        );
        assert!(verdict.to_string().contains("wireguard alive: false"));
    }

    #[test]
    fn test_garbage_is_unreadable() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("status.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            health_check(&path, Duration::from_secs(15)),
            HealthVerdict::Unreadable(_)
        ));
    }

    #[test]
    fn test_states_serialize_snake_case() {
        let json = serde_json::to_value(doc(Utc::now(), true, true)).expect("json");
        assert_eq!(json["tunnel"]["state"], "connected");
        assert_eq!(json["server"]["state"], "up");
    }
}
