//! Health supervisor.
//!
//! Runs for the rest of the process lifetime after startup. Every tick it
//! probes both controllers, restarts whichever is dead, applies pending peer
//! additions, and writes the status document. Failures are logged and retried
//! on the next tick; there is no backoff.

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::legacy::TunnelClient;
use crate::lock::{StoreLock, DEFAULT_LOCK_TIMEOUT};
use crate::persist::remove_if_exists;
use crate::sequencer::RunningBridge;
use crate::server::ModernServer;
use crate::state::{SetupInfo, SharedState};
use crate::status::{write_status, ServerStatus, StatusDocument, TunnelStatus};
use crate::store::MaterialStore;

/// What one tick observed and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Legacy client alive at the end of the tick.
    pub tunnel_alive: bool,
    /// Server alive at the end of the tick.
    pub server_alive: bool,
    /// The legacy client was restarted.
    pub tunnel_restarted: bool,
    /// The tunnel came back on a different interface.
    pub tunnel_changed: bool,
    /// The server was brought back up.
    pub server_restarted: bool,
    /// A new config was applied with `reload`.
    pub reloaded: bool,
    /// The server still forwards to a tunnel interface that is gone.
    pub rebind_pending: bool,
}

/// Supervises a running bridge.
#[derive(Debug)]
pub struct Supervisor<T, S> {
    config: BridgeConfig,
    store: MaterialStore,
    tunnel: T,
    server: S,
    state: SharedState,
    last: TickReport,
    shutdown_tx: broadcast::Sender<()>,
}

impl<T, S> Supervisor<T, S>
where
    T: TunnelClient,
    S: ModernServer,
{
    /// Takes over a bridge that completed startup.
    #[must_use]
    pub fn new(bridge: RunningBridge<T, S>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: bridge.config,
            store: bridge.store,
            tunnel: bridge.tunnel,
            server: bridge.server,
            state: bridge.state,
            last: TickReport {
                tunnel_alive: true,
                server_alive: true,
                ..TickReport::default()
            },
            shutdown_tx,
        }
    }

    /// Sender that stops [`Supervisor::run`].
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// The shared bridge state.
    #[must_use]
    pub fn state(&self) -> SharedState {
        SharedState::clone(&self.state)
    }

    /// True if both components were alive at the end of the last tick and
    /// the server forwards to the current tunnel.
    #[must_use]
    pub fn health_check(&self) -> bool {
        self.last.tunnel_alive && self.last.server_alive && !self.last.rebind_pending
    }

    /// Runs one supervision pass.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            tunnel_alive: self.tunnel.is_alive().await,
            server_alive: self.server.is_alive().await,
            ..TickReport::default()
        };

        if !report.tunnel_alive {
            warn!("legacy tunnel is down, restarting");
            report.tunnel_restarted = true;
            match self.restart_tunnel().await {
                Ok(changed) => {
                    report.tunnel_alive = true;
                    report.tunnel_changed = changed;
                }
                Err(e) => error!(error = %e, "legacy tunnel restart failed, retrying next tick"),
            }
        }

        if self.needs_rebind().await {
            if report.tunnel_alive {
                match self.rerender_and_reload().await {
                    Ok(()) => report.reloaded = true,
                    Err(e) => {
                        error!(error = %e, "rebinding to new tunnel failed, retrying next tick");
                        report.rebind_pending = true;
                    }
                }
            } else {
                report.rebind_pending = true;
            }
        }

        if !report.server_alive {
            warn!(interface = %self.server.interface(), "server is down, bringing it back up");
            report.server_restarted = true;
            match self.server.up().await {
                Ok(()) => report.server_alive = true,
                Err(e) => error!(error = %e, "server restart failed, retrying next tick"),
            }
        }

        if self.config.reload_marker_path().exists() {
            match self.apply_pending_peers().await {
                Ok(()) => report.reloaded = true,
                Err(e) => error!(error = %e, "applying new peers failed, retrying next tick"),
            }
        }

        if let Err(e) = self.write_status(&report).await {
            warn!(error = %e, "failed to write status file");
        }

        self.last = report;
        report
    }

    /// Ticks until shutdown is requested, then stops both components.
    ///
    /// SIGINT, SIGTERM and the [`Supervisor::shutdown_handle`] request
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only if shutdown cleanup fails.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        spawn_signal_listener(self.shutdown_tx.clone());
        self.run_until(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
    }

    /// Ticks until `shutdown` completes, then stops both components.
    ///
    /// # Errors
    ///
    /// Returns an error only if shutdown cleanup fails.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.health_interval_secs,
            "health supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "supervisor tick");
                }
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Brings the server down, stops the legacy client and removes the
    /// status document.
    ///
    /// # Errors
    ///
    /// Returns the first cleanup error; every step is attempted regardless.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down bridge");
        let server = self.server.down().await;
        if let Err(ref e) = server {
            error!(error = %e, "failed to bring server down");
        }
        let tunnel = self.tunnel.stop().await;
        if let Err(ref e) = tunnel {
            error!(error = %e, "failed to stop legacy client");
        }
        let status = remove_if_exists(&self.config.status_file);
        info!("bridge stopped");
        server.and(tunnel).and(status)
    }

    async fn restart_tunnel(&mut self) -> Result<bool> {
        self.tunnel.stop().await?;
        self.tunnel.start().await?;
        let interface = self.tunnel.await_tunnel(self.config.tunnel_timeout()).await?;

        let mut state = self.state.write().await;
        let changed = state.tunnel.interface != interface;
        if changed {
            info!(old = %state.tunnel.interface, new = %interface, "tunnel interface changed");
        } else {
            info!(interface = %interface, "legacy tunnel restored");
        }
        if let Some(info) = self.tunnel.tunnel() {
            state.tunnel = info.clone();
        }
        Ok(changed)
    }

    async fn needs_rebind(&self) -> bool {
        let state = self.state.read().await;
        state.tunnel.interface != state.bound_tunnel
    }

    async fn rerender_and_reload(&mut self) -> Result<()> {
        let _lock = StoreLock::acquire(&self.config.lock_path(), DEFAULT_LOCK_TIMEOUT).await?;
        let rendered = {
            let state = self.state.read().await;
            self.store
                .render_server_config(&state.server, &state.peers, &state.tunnel.interface)
        };
        self.server.reload(&rendered).await?;

        let mut state = self.state.write().await;
        state.rendered_server_config = rendered;
        state.bound_tunnel = state.tunnel.interface.clone();
        info!(interface = %state.bound_tunnel, "server rebound to tunnel");

        let setup_path = self.config.setup_info_path();
        let refreshed = SetupInfo::load(&setup_path).and_then(|mut setup| {
            setup.tunnel_interface.clone_from(&state.bound_tunnel);
            setup.save(&setup_path)
        });
        if let Err(e) = refreshed {
            warn!(error = %e, "failed to record new tunnel in setup info");
        }
        Ok(())
    }

    async fn apply_pending_peers(&mut self) -> Result<()> {
        let _lock = StoreLock::acquire(&self.config.lock_path(), DEFAULT_LOCK_TIMEOUT).await?;
        let peers = self.store.load_peers()?;
        let rendered = {
            let state = self.state.read().await;
            self.store
                .render_server_config(&state.server, &peers, &state.tunnel.interface)
        };
        self.server.reload(&rendered).await?;

        {
            let mut state = self.state.write().await;
            let added = peers.len().saturating_sub(state.peers.len());
            state.peers = peers;
            state.rendered_server_config = rendered;
            state.bound_tunnel = state.tunnel.interface.clone();
            info!(added, total = state.peers.len(), "server reloaded with new peers");
        }
        remove_if_exists(&self.config.reload_marker_path())
    }

    async fn write_status(&self, report: &TickReport) -> Result<()> {
        let now = Utc::now();
        let doc = {
            let mut state = self.state.write().await;
            if report.tunnel_alive {
                state.tunnel_last_alive = Some(now);
            }
            if report.server_alive {
                state.server_last_alive = Some(now);
            }
            StatusDocument {
                updated_at: now,
                tunnel: TunnelStatus {
                    state: self.tunnel.state(),
                    alive: report.tunnel_alive,
                    interface: self.tunnel.tunnel().map(|t| t.interface.clone()),
                    pid: self.tunnel.pid(),
                    last_alive: state.tunnel_last_alive,
                },
                server: ServerStatus {
                    state: self.server.state(),
                    alive: report.server_alive && !report.rebind_pending,
                    interface: self.server.interface().to_string(),
                    last_alive: state.server_last_alive,
                },
                peers: state.peers.len(),
            }
        };
        write_status(&self.config.status_file, &doc)
    }
}

/// Sends on `shutdown_tx` when SIGINT or SIGTERM arrives.
pub fn spawn_signal_listener(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, initiating shutdown");
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, initiating shutdown"),
        _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received SIGINT, initiating shutdown");
    }
}
