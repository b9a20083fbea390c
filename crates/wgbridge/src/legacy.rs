//! Legacy tunnel client controller.
//!
//! Runs the OpenVPN client as a child process and finds the tun interface it
//! creates. The interface name is rediscovered on every start and never
//! persisted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use wgb_validation::{AllowedProgram, SafeCommand};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Config file extensions, in lookup priority.
pub const CONFIG_EXTENSIONS: [&str; 2] = ["ovpn", "conf"];

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the legacy client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Not running.
    Stopped,
    /// Process launched, tunnel not yet seen.
    Starting,
    /// Tunnel interface is up.
    Connected,
    /// Process died or the tunnel never appeared.
    Failed,
}

/// A discovered tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    /// Interface name, e.g. `tun0`.
    pub interface: String,
    /// When it was first seen.
    pub discovered_at: DateTime<Utc>,
}

impl TunnelInfo {
    fn now(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            discovered_at: Utc::now(),
        }
    }
}

/// Controls the upstream tunnel client.
#[allow(async_fn_in_trait)]
pub trait TunnelClient {
    /// Locates the client config and launches the client.
    async fn start(&mut self) -> Result<()>;

    /// Waits for the tunnel interface, returning its name.
    async fn await_tunnel(&mut self, timeout: Duration) -> Result<String>;

    /// Liveness probe.
    async fn is_alive(&mut self) -> bool;

    /// Terminates the client. No-op when already stopped.
    async fn stop(&mut self) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> ClientState;

    /// The tunnel found by the last successful [`TunnelClient::await_tunnel`].
    fn tunnel(&self) -> Option<&TunnelInfo>;

    /// Process id of the running client.
    fn pid(&self) -> Option<u32>;
}

/// Finds the client config in `dir`: `*.ovpn` before `*.conf`, by file name
/// within each extension.
///
/// # Errors
///
/// Returns [`BridgeError::NoConfigFound`] if the directory is missing or
/// holds no matching file.
pub fn discover_config(dir: &Path) -> Result<PathBuf> {
    let not_found = || BridgeError::NoConfigFound {
        dir: dir.to_path_buf(),
    };
    let entries = fs::read_dir(dir).map_err(|_| not_found())?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    CONFIG_EXTENSIONS
        .iter()
        .find_map(|ext| {
            files
                .iter()
                .find(|path| path.extension().is_some_and(|e| e == *ext))
                .cloned()
        })
        .ok_or_else(not_found)
}

/// Extracts interface names from `ip -o link show type tun` output.
///
/// Lines look like `7: tun0: <POINTOPOINT,UP> mtu 1500 ...`; the name is the
/// second colon-separated field with any `@parent` suffix removed.
#[must_use]
pub fn parse_tun_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(|field| field.trim().split('@').next().unwrap_or_default().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

async fn list_tun_interfaces(use_sudo: bool) -> Result<Vec<String>> {
    let output = SafeCommand::new(AllowedProgram::Ip)
        .privileged(use_sudo)
        .args(["-o", "link", "show", "type", "tun"])
        .execute()
        .await?;
    Ok(parse_tun_interfaces(&output.stdout_lossy()))
}

/// Picks the tunnel among `current`: the first one absent from `baseline`.
/// Interfaces that predate the client start never count as its tunnel.
fn pick_tunnel(current: &[String], baseline: &HashSet<String>) -> Option<String> {
    current
        .iter()
        .find(|name| !baseline.contains(*name))
        .cloned()
}

/// [`TunnelClient`] backed by the `openvpn` binary.
#[derive(Debug)]
pub struct OpenVpnClient {
    config_dir: PathBuf,
    log_dir: PathBuf,
    log_level: Option<u8>,
    extra_args: Vec<String>,
    run_as: Option<String>,
    use_sudo: bool,
    child: Option<Child>,
    state: ClientState,
    tunnel: Option<TunnelInfo>,
    baseline: HashSet<String>,
}

impl OpenVpnClient {
    /// Creates a stopped client from the bridge config.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            config_dir: config.openvpn_config_dir.clone(),
            log_dir: config.openvpn_log_dir.clone(),
            log_level: config.openvpn_log_level,
            extra_args: config.openvpn_additional_args.clone(),
            run_as: config.run_as.clone(),
            use_sudo: config.use_sudo,
            child: None,
            state: ClientState::Stopped,
            tunnel: None,
            baseline: HashSet::new(),
        }
    }

    /// Builds the client command line for `config_path`.
    #[must_use]
    pub fn command(&self, config_path: &Path) -> SafeCommand {
        let log_file = self.log_dir.join("openvpn.log");
        let mut cmd = SafeCommand::new(AllowedProgram::OpenVpn)
            .privileged(self.use_sudo)
            .arg("--config")
            .arg(config_path.to_string_lossy())
            .arg("--log")
            .arg(log_file.to_string_lossy());
        if let Some(level) = self.log_level {
            cmd = cmd.arg("--verb").arg(level.to_string());
        }
        cmd = cmd.args(&self.extra_args);
        if let Some(ref user) = self.run_as {
            cmd = cmd.args(["--user", user.as_str(), "--group", user.as_str()]);
        }
        cmd
    }

    fn child_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!(%status, "openvpn exited");
                false
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to poll openvpn");
                false
            }
            None => false,
        }
    }
}

impl TunnelClient for OpenVpnClient {
    async fn start(&mut self) -> Result<()> {
        if self.child_running() {
            debug!("openvpn already running");
            return Ok(());
        }

        let config_path = discover_config(&self.config_dir)?;
        info!(config = %config_path.display(), "found OpenVPN config");

        fs::create_dir_all(&self.log_dir).map_err(|e| BridgeError::io(&self.log_dir, e))?;

        self.baseline = list_tun_interfaces(self.use_sudo)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        let command = self.command(&config_path);
        info!(command = %command.command_description(), "starting openvpn");
        match command.spawn() {
            Ok(child) => {
                self.child = Some(child);
                self.tunnel = None;
                self.state = ClientState::Starting;
                Ok(())
            }
            Err(e) => {
                self.state = ClientState::Failed;
                Err(e.into())
            }
        }
    }

    async fn await_tunnel(&mut self, timeout: Duration) -> Result<String> {
        let started = Instant::now();
        let mut polls: u32 = 0;
        info!(timeout_secs = timeout.as_secs(), "waiting for tunnel interface");

        loop {
            if !self.child_running() {
                self.state = ClientState::Failed;
                return Err(BridgeError::activation(
                    "openvpn",
                    "process exited before the tunnel came up",
                ));
            }

            match list_tun_interfaces(self.use_sudo).await {
                Ok(current) => {
                    if let Some(name) = pick_tunnel(&current, &self.baseline) {
                        info!(interface = %name, "tunnel interface detected");
                        self.tunnel = Some(TunnelInfo::now(name.clone()));
                        self.state = ClientState::Connected;
                        return Ok(name);
                    }
                }
                Err(e) => warn!(error = %e, "error listing tun interfaces"),
            }

            polls += 1;
            if started.elapsed() >= timeout {
                self.state = ClientState::Failed;
                return Err(BridgeError::TunnelTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
            if polls % 10 == 0 {
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    timeout_secs = timeout.as_secs(),
                    "still waiting for tunnel interface"
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn is_alive(&mut self) -> bool {
        if !self.child_running() {
            if self.state != ClientState::Stopped {
                self.state = ClientState::Failed;
            }
            return false;
        }
        let Some(interface) = self.tunnel.as_ref().map(|t| t.interface.clone()) else {
            return false;
        };
        match list_tun_interfaces(self.use_sudo).await {
            Ok(current) if current.contains(&interface) => true,
            Ok(_) => {
                warn!(interface = %interface, "tunnel interface disappeared");
                self.state = ClientState::Failed;
                false
            }
            Err(e) => {
                warn!(error = %e, "tunnel health check failed");
                false
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.state = ClientState::Stopped;
            return Ok(());
        };

        if let Some(pid) = child.id() {
            info!(pid, "stopping openvpn");
            let signalled = SafeCommand::new(AllowedProgram::Kill)
                .privileged(self.use_sudo)
                .arg("-TERM")
                .arg(pid.to_string())
                .execute_unchecked()
                .await;
            if let Err(e) = signalled {
                warn!(error = %e, "failed to signal openvpn");
            }

            if tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
                warn!(pid, "openvpn did not exit after SIGTERM, killing");
                child.kill().await.map_err(|e| BridgeError::io("openvpn", e))?;
            }
        }

        self.tunnel = None;
        self.state = ClientState::Stopped;
        Ok(())
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn tunnel(&self) -> Option<&TunnelInfo> {
        self.tunnel.as_ref()
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[derive(Debug)]
struct FakeTunnelControl {
    config_present: bool,
    connects: bool,
    next_interface: String,
    running: bool,
    starts: u32,
    stops: u32,
}

/// In-memory [`TunnelClient`] for tests.
///
/// Clones share the same control block, so a test can keep one clone and
/// drive the other through the sequencer or supervisor.
#[derive(Debug, Clone)]
pub struct FakeTunnelClient {
    control: Arc<RwLock<FakeTunnelControl>>,
    state: ClientState,
    tunnel: Option<TunnelInfo>,
}

impl FakeTunnelClient {
    /// A client that connects and reports `interface`.
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            control: Arc::new(RwLock::new(FakeTunnelControl {
                config_present: true,
                connects: true,
                next_interface: interface.into(),
                running: false,
                starts: 0,
                stops: 0,
            })),
            state: ClientState::Stopped,
            tunnel: None,
        }
    }

    /// A client whose config directory is empty.
    #[must_use]
    pub fn without_config() -> Self {
        let client = Self::new("tun0");
        if let Ok(mut control) = client.control.try_write() {
            control.config_present = false;
        }
        client
    }

    /// A client whose tunnel never appears.
    #[must_use]
    pub fn never_connects() -> Self {
        let client = Self::new("tun0");
        if let Ok(mut control) = client.control.try_write() {
            control.connects = false;
        }
        client
    }

    /// Simulates the client process dying.
    pub async fn crash(&self) {
        self.control.write().await.running = false;
    }

    /// Sets the interface reported by the next start.
    pub async fn set_next_interface(&self, interface: impl Into<String>) {
        self.control.write().await.next_interface = interface.into();
    }

    /// How many times the client was started.
    pub async fn start_count(&self) -> u32 {
        self.control.read().await.starts
    }

    /// How many times the client was stopped while running.
    pub async fn stop_count(&self) -> u32 {
        self.control.read().await.stops
    }

    /// Whether the simulated process is running.
    pub async fn is_running(&self) -> bool {
        self.control.read().await.running
    }
}

impl TunnelClient for FakeTunnelClient {
    async fn start(&mut self) -> Result<()> {
        let mut control = self.control.write().await;
        if !control.config_present {
            return Err(BridgeError::NoConfigFound {
                dir: PathBuf::from("/etc/openvpn/config"),
            });
        }
        control.running = true;
        control.starts += 1;
        self.tunnel = None;
        self.state = ClientState::Starting;
        Ok(())
    }

    async fn await_tunnel(&mut self, timeout: Duration) -> Result<String> {
        let (connects, interface) = {
            let control = self.control.read().await;
            (control.connects && control.running, control.next_interface.clone())
        };
        if !connects {
            tokio::time::sleep(timeout).await;
            self.state = ClientState::Failed;
            return Err(BridgeError::TunnelTimeout {
                timeout_secs: timeout.as_secs(),
            });
        }
        self.tunnel = Some(TunnelInfo::now(interface.clone()));
        self.state = ClientState::Connected;
        Ok(interface)
    }

    async fn is_alive(&mut self) -> bool {
        let running = self.control.read().await.running;
        if !running && self.state != ClientState::Stopped {
            self.state = ClientState::Failed;
        }
        running && self.state == ClientState::Connected
    }

    async fn stop(&mut self) -> Result<()> {
        let mut control = self.control.write().await;
        if control.running {
            control.running = false;
            control.stops += 1;
        }
        self.tunnel = None;
        self.state = ClientState::Stopped;
        Ok(())
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn tunnel(&self) -> Option<&TunnelInfo> {
        self.tunnel.as_ref()
    }

    fn pid(&self) -> Option<u32> {
        (self.state != ClientState::Stopped).then_some(4242)
    }
}
