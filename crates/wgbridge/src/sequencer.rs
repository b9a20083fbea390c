//! Startup phase sequencer.
//!
//! Phases run strictly in order and each is gated on the previous one:
//!
//! 1. infrastructure: enable forwarding
//! 2. legacy tunnel: start the client and wait for its interface
//! 3. identities: materialise keys, peer configs and the setup summary
//! 4. modern server: render, configure and bring up the server
//!
//! Any failure is fatal. Components already started are stopped before the
//! error is returned so nothing is left half-wired.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::endpoint::resolve_endpoint;
use crate::error::{BridgeError, Phase, Result, StartupError};
use crate::host::HostSetup;
use crate::legacy::{TunnelClient, TunnelInfo};
use crate::lock::{StoreLock, DEFAULT_LOCK_TIMEOUT};
use crate::persist::remove_if_exists;
use crate::server::ModernServer;
use crate::state::{BridgeState, SetupInfo, SharedState};
use crate::store::{MaterialStore, PeerIdentity, ServerIdentity};

/// A bridge that completed startup, ready for supervision.
#[derive(Debug)]
pub struct RunningBridge<T, S> {
    /// Bridge configuration.
    pub config: BridgeConfig,
    /// Material store.
    pub store: MaterialStore,
    /// Legacy client controller, connected.
    pub tunnel: T,
    /// Server controller, up.
    pub server: S,
    /// Bridge state.
    pub state: SharedState,
}

/// Drives the startup phases.
#[derive(Debug)]
pub struct Sequencer<H, T, S> {
    config: BridgeConfig,
    store: MaterialStore,
    host: H,
    tunnel: T,
    server: S,
}

struct Identities {
    server: ServerIdentity,
    peers: Vec<PeerIdentity>,
    endpoint: String,
}

struct Started {
    tunnel: TunnelInfo,
    identities: Identities,
    rendered: String,
}

impl<H, T, S> Sequencer<H, T, S>
where
    H: HostSetup,
    T: TunnelClient,
    S: ModernServer,
{
    /// Creates a sequencer over the given controllers.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the configuration is invalid.
    pub fn new(config: BridgeConfig, host: H, tunnel: T, server: S) -> Result<Self> {
        config.validate()?;
        let store = MaterialStore::new(&config)?;
        Ok(Self {
            config,
            store,
            host,
            tunnel,
            server,
        })
    }

    /// Runs all phases.
    ///
    /// # Errors
    ///
    /// Returns a [`StartupError`] naming the failed phase.
    pub async fn run(self) -> std::result::Result<RunningBridge<T, S>, StartupError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs all phases, abandoning startup when `shutdown` completes first.
    ///
    /// An interrupted startup unwinds exactly like a failed one: whatever was
    /// already started is stopped and the error names the phase in progress.
    ///
    /// # Errors
    ///
    /// Returns a [`StartupError`] naming the failed phase, with
    /// [`BridgeError::Interrupted`] as the source if `shutdown` won.
    pub async fn run_until<F>(
        mut self,
        shutdown: F,
    ) -> std::result::Result<RunningBridge<T, S>, StartupError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut reached = Phase::Infrastructure;

        let outcome = tokio::select! {
            result = self.start(&mut reached) => Some(result),
            () = &mut shutdown => None,
        };

        let source = match outcome {
            Some(Ok(started)) => return Ok(self.into_running(started)),
            Some(Err(e)) => e,
            None => {
                warn!(phase = reached.number(), "shutdown requested during startup");
                BridgeError::Interrupted
            }
        };
        self.unwind(reached).await;
        Err(StartupError::new(reached, source))
    }

    async fn start(&mut self, reached: &mut Phase) -> Result<Started> {
        info!(phase = Phase::Infrastructure.number(), "phase 1/4: enabling IP forwarding");
        self.host.enable_forwarding().await?;
        info!("phase 1/4 complete");

        *reached = Phase::LegacyTunnel;
        info!(phase = Phase::LegacyTunnel.number(), "phase 2/4: starting legacy tunnel");
        let tunnel = self.start_tunnel().await?;
        info!(interface = %tunnel.interface, "phase 2/4 complete");

        *reached = Phase::Identities;
        info!(phase = Phase::Identities.number(), "phase 3/4: materialising identities");
        let identities = self.materialise(&tunnel).await?;
        info!(peers = identities.peers.len(), "phase 3/4 complete");

        *reached = Phase::ModernServer;
        info!(phase = Phase::ModernServer.number(), "phase 4/4: starting server");
        let rendered =
            self.store
                .render_server_config(&identities.server, &identities.peers, &tunnel.interface);
        self.start_server(&rendered).await?;
        info!(interface = %self.server.interface(), "phase 4/4 complete, bridge is up");

        Ok(Started {
            tunnel,
            identities,
            rendered,
        })
    }

    /// Stops whatever the phases up to and including `reached` started.
    async fn unwind(&mut self, reached: Phase) {
        if reached == Phase::ModernServer {
            if let Err(down) = self.server.down().await {
                warn!(error = %down, "failed to bring server down after failed start");
            }
        }
        if reached != Phase::Infrastructure {
            self.stop_tunnel().await;
        }
    }

    fn into_running(self, started: Started) -> RunningBridge<T, S> {
        let Started {
            tunnel,
            identities,
            rendered,
        } = started;
        let state = BridgeState {
            server: identities.server,
            peers: identities.peers,
            bound_tunnel: tunnel.interface.clone(),
            tunnel,
            endpoint: identities.endpoint,
            rendered_server_config: rendered,
            tunnel_last_alive: None,
            server_last_alive: None,
        };

        RunningBridge {
            config: self.config,
            store: self.store,
            tunnel: self.tunnel,
            server: self.server,
            state: Arc::new(RwLock::new(state)),
        }
    }

    async fn start_tunnel(&mut self) -> Result<TunnelInfo> {
        self.tunnel.start().await?;
        let interface = self.tunnel.await_tunnel(self.config.tunnel_timeout()).await?;
        Ok(self
            .tunnel
            .tunnel()
            .cloned()
            .unwrap_or_else(|| TunnelInfo {
                interface,
                discovered_at: chrono::Utc::now(),
            }))
    }

    async fn stop_tunnel(&mut self) {
        if let Err(e) = self.tunnel.stop().await {
            error!(error = %e, "failed to stop legacy client");
        }
    }

    async fn materialise(&self, tunnel: &TunnelInfo) -> Result<Identities> {
        let endpoint = resolve_endpoint(self.config.public_ip.as_deref()).await;
        let names = self.config.client_names()?;

        let _lock = StoreLock::acquire(&self.config.lock_path(), DEFAULT_LOCK_TIMEOUT).await?;

        let server = self.store.ensure_server_identity()?;
        let peers = self.store.ensure_peer_identities(&names)?;

        for peer in &peers {
            let rendered = self
                .store
                .render_peer_config(peer, server.public_key(), &endpoint);
            let path = self.store.write_peer_config(&peer.name, &rendered)?;
            info!(peer = %peer.name, address = %peer.address, path = %path.display(), "peer config written");
        }

        SetupInfo {
            config_name: self.config.config_name.clone(),
            listen_port: self.config.listen_port,
            tunnel_interface: tunnel.interface.clone(),
            server_public_key: server.public_key().to_base64(),
            endpoint: endpoint.clone(),
            address_range: self.store.pool().to_string(),
        }
        .save(&self.config.setup_info_path())?;

        // every persisted peer is loaded above, so a pending reload is moot
        remove_if_exists(&self.config.reload_marker_path())?;

        Ok(Identities {
            server,
            peers,
            endpoint,
        })
    }

    async fn start_server(&mut self, rendered: &str) -> Result<()> {
        self.server.configure(rendered).await?;
        self.server.up().await
    }
}

/// Builds the error the binary reports for a failed startup.
#[must_use]
pub fn describe_failure(err: &StartupError) -> String {
    let hint = match &err.source {
        BridgeError::NoConfigFound { .. } => "mount an OpenVPN client config (*.ovpn or *.conf)",
        BridgeError::TunnelTimeout { .. } => "check the OpenVPN log and the upstream gateway",
        BridgeError::Activation { .. } => "check that the listen port is free and the config is valid",
        BridgeError::NameCollision { .. } => "the peer manifest was edited; restore it from backup",
        BridgeError::Interrupted => "startup was cancelled; nothing was left running",
        _ => "see the error above",
    };
    format!("{err}; {hint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use crate::legacy::FakeTunnelClient;
    use crate::server::FakeModernServer;
    use tempfile::TempDir;

    fn config(dir: &std::path::Path) -> BridgeConfig {
        BridgeConfig {
            wireguard_dir: dir.to_path_buf(),
            clients: "alice,bob".to_string(),
            public_ip: Some("203.0.113.7".to_string()),
            tunnel_timeout_secs: 1,
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_successful_startup() {
        let dir = TempDir::new().expect("tempdir");
        let host = FakeHost::new();
        let tunnel = FakeTunnelClient::new("tun0");
        let server = FakeModernServer::new("wg0");

        let bridge = Sequencer::new(config(dir.path()), host.clone(), tunnel.clone(), server.clone())
            .expect("sequencer")
            .run()
            .await
            .expect("startup");

        assert_eq!(host.calls(), 1);
        assert!(tunnel.is_running().await);
        assert!(server.is_running().await);
        let applied = server.applied_config().await.expect("applied");
        assert!(applied.contains("-o tun0 -j MASQUERADE"));

        let state = bridge.state.read().await;
        assert_eq!(state.tunnel.interface, "tun0");
        assert_eq!(state.peers.len(), 2);
        assert_eq!(state.endpoint, "203.0.113.7");

        assert!(dir.path().join("clients/alice.conf").exists());
        assert!(dir.path().join("clients/bob.conf").exists());
        let info = SetupInfo::load(&dir.path().join("setup-info.json")).expect("setup info");
        assert_eq!(info.tunnel_interface, "tun0");
        assert_eq!(info.endpoint, "203.0.113.7");
        assert!(!dir.path().join(".bridge.lock").exists());
    }

    #[tokio::test]
    async fn test_infrastructure_failure_stops_before_tunnel() {
        let dir = TempDir::new().expect("tempdir");
        let tunnel = FakeTunnelClient::new("tun0");
        let err = Sequencer::new(
            config(dir.path()),
            FakeHost::failing(),
            tunnel.clone(),
            FakeModernServer::new("wg0"),
        )
        .expect("sequencer")
        .run()
        .await
        .expect_err("fails");
        assert_eq!(err.phase, Phase::Infrastructure);
        assert_eq!(tunnel.start_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_upstream_config_never_touches_server() {
        let dir = TempDir::new().expect("tempdir");
        let server = FakeModernServer::new("wg0");
        let err = Sequencer::new(
            config(dir.path()),
            FakeHost::new(),
            FakeTunnelClient::without_config(),
            server.clone(),
        )
        .expect("sequencer")
        .run()
        .await
        .expect_err("fails");
        assert_eq!(err.phase, Phase::LegacyTunnel);
        assert!(matches!(err.source, BridgeError::NoConfigFound { .. }));
        assert_eq!(server.up_count().await, 0);
        assert!(!dir.path().join("keys").exists());
    }

    #[tokio::test]
    async fn test_server_failure_stops_tunnel() {
        let dir = TempDir::new().expect("tempdir");
        let tunnel = FakeTunnelClient::new("tun0");
        let err = Sequencer::new(
            config(dir.path()),
            FakeHost::new(),
            tunnel.clone(),
            FakeModernServer::failing("wg0"),
        )
        .expect("sequencer")
        .run()
        .await
        .expect_err("fails");
        assert_eq!(err.phase, Phase::ModernServer);
        assert!(!tunnel.is_running().await);
        assert_eq!(tunnel.stop_count().await, 1);
        assert!(describe_failure(&err).contains("listen port"));
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_tunnel_stops_client() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = BridgeConfig {
            tunnel_timeout_secs: 30,
            ..config(dir.path())
        };
        let tunnel = FakeTunnelClient::never_connects();
        let server = FakeModernServer::new("wg0");

        let started = std::time::Instant::now();
        let err = Sequencer::new(cfg, FakeHost::new(), tunnel.clone(), server.clone())
            .expect("sequencer")
            .run_until(tokio::time::sleep(std::time::Duration::from_millis(100)))
            .await
            .expect_err("interrupted");

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(err.phase, Phase::LegacyTunnel);
        assert!(matches!(err.source, BridgeError::Interrupted));
        assert!(!tunnel.is_running().await);
        assert_eq!(tunnel.stop_count().await, 1);
        assert_eq!(server.up_count().await, 0);
        assert!(!dir.path().join("keys").exists());
    }

    #[tokio::test]
    async fn test_collision_is_fatal_in_identities_phase() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(dir.path());
        MaterialStore::new(&cfg)
            .expect("store")
            .ensure_peer_identities(&["alice".to_string()])
            .expect("seed");
        let manifest = dir.path().join("keys/peers.json");
        let tampered = std::fs::read_to_string(&manifest)
            .expect("read")
            .replace("10.9.0.2", "10.9.0.50");
        std::fs::write(&manifest, tampered).expect("write");

        let tunnel = FakeTunnelClient::new("tun0");
        let err = Sequencer::new(cfg, FakeHost::new(), tunnel.clone(), FakeModernServer::new("wg0"))
            .expect("sequencer")
            .run()
            .await
            .expect_err("fails");
        assert_eq!(err.phase, Phase::Identities);
        assert!(matches!(err.source, BridgeError::NameCollision { .. }));
        assert!(!tunnel.is_running().await);
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let cfg = BridgeConfig {
            listen_port: 0,
            ..BridgeConfig::default()
        };
        let result = Sequencer::new(
            cfg,
            FakeHost::new(),
            FakeTunnelClient::new("tun0"),
            FakeModernServer::new("wg0"),
        );
        assert!(result.is_err());
    }
}
