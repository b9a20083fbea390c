//! Modern server controller.
//!
//! Drives the WireGuard server interface through `wg-quick` and `wg`. The
//! rendered config on disk is the last known good config: `up` always
//! activates whatever was last written by `configure` or `reload`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use wgb_validation::{AllowedProgram, CommandError, SafeCommand};
use wgb_wireguard::{parse_wg_config, InterfaceConfig};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::persist::{read_optional, remove_if_exists, write_atomic, MODE_SECRET};

/// Lifecycle of the server interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Interface not present.
    Down,
    /// Config written, interface not yet up.
    Configured,
    /// Interface up.
    Up,
    /// A new config is being applied to the running interface.
    Reloading,
}

/// Controls the modern server interface.
#[allow(async_fn_in_trait)]
pub trait ModernServer {
    /// Writes the rendered config. No process side effects.
    async fn configure(&mut self, rendered: &str) -> Result<()>;

    /// Activates the interface from the on-disk config.
    async fn up(&mut self) -> Result<()>;

    /// Applies a new config to the running interface without dropping
    /// established peer sessions.
    async fn reload(&mut self, rendered: &str) -> Result<()>;

    /// Deactivates the interface and its forwarding rules.
    async fn down(&mut self) -> Result<()>;

    /// Liveness probe.
    async fn is_alive(&mut self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> ServerState;

    /// The interface name.
    fn interface(&self) -> &str;
}

/// Fields of `[Interface]` that `wg syncconf` cannot apply: a change to any
/// of them needs the interface cycled.
fn interface_fields_differ(old: &InterfaceConfig, new: &InterfaceConfig) -> bool {
    old.addresses != new.addresses
        || old.listen_port != new.listen_port
        || old.post_up != new.post_up
        || old.post_down != new.post_down
}

/// [`ModernServer`] backed by `wg-quick`.
#[derive(Debug)]
pub struct WgQuickServer {
    interface: String,
    config_path: PathBuf,
    use_sudo: bool,
    state: ServerState,
}

impl WgQuickServer {
    /// Creates a controller for the configured interface.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            interface: config.config_name.clone(),
            config_path: config.server_config_path(),
            use_sudo: config.use_sudo,
            state: ServerState::Down,
        }
    }

    /// Path of the rendered server config.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn command(&self, program: AllowedProgram) -> SafeCommand {
        SafeCommand::new(program).privileged(self.use_sudo)
    }

    fn write_config(&self, rendered: &str) -> Result<()> {
        parse_wg_config(rendered)?;
        write_atomic(&self.config_path, rendered.as_bytes(), MODE_SECRET)
    }

    async fn wg_quick(&self, action: &str) -> std::result::Result<(), CommandError> {
        self.command(AllowedProgram::WgQuick)
            .arg(action)
            .arg(self.config_path.to_string_lossy())
            .execute()
            .await
            .map(|_| ())
    }

    async fn sync(&self) -> Result<()> {
        let stripped = self
            .command(AllowedProgram::WgQuick)
            .arg("strip")
            .arg(self.config_path.to_string_lossy())
            .execute()
            .await?;

        let temp = self
            .config_path
            .with_file_name(format!(".{}.stripped", self.interface));
        write_atomic(&temp, &stripped.stdout, MODE_SECRET)?;

        let synced = self
            .command(AllowedProgram::Wg)
            .arg("syncconf")
            .arg(&self.interface)
            .arg(temp.to_string_lossy())
            .execute()
            .await;
        remove_if_exists(&temp)?;
        synced?;
        Ok(())
    }
}

impl ModernServer for WgQuickServer {
    async fn configure(&mut self, rendered: &str) -> Result<()> {
        self.write_config(rendered)?;
        if self.state == ServerState::Down {
            self.state = ServerState::Configured;
        }
        info!(path = %self.config_path.display(), "server config written");
        Ok(())
    }

    async fn up(&mut self) -> Result<()> {
        if read_optional(&self.config_path)?.is_none() {
            return Err(BridgeError::activation(
                &self.interface,
                format!("no config at {}", self.config_path.display()),
            ));
        }
        info!(interface = %self.interface, "bringing up server interface");
        self.wg_quick("up").await.map_err(|e| {
            self.state = ServerState::Down;
            match e {
                CommandError::NonZeroExit { stderr, .. } => {
                    BridgeError::activation(&self.interface, stderr)
                }
                other => BridgeError::activation(&self.interface, other.to_string()),
            }
        })?;
        self.state = ServerState::Up;
        info!(interface = %self.interface, "server interface up");
        Ok(())
    }

    async fn reload(&mut self, rendered: &str) -> Result<()> {
        let previous = read_optional(&self.config_path)?
            .and_then(|text| parse_wg_config(&text).ok());
        let next = parse_wg_config(rendered)?;

        if self.state != ServerState::Up {
            self.write_config(rendered)?;
            if self.state == ServerState::Down {
                self.state = ServerState::Configured;
            }
            return Ok(());
        }

        let needs_cycle = previous
            .as_ref()
            .is_none_or(|old| interface_fields_differ(old, &next));

        if needs_cycle {
            info!(interface = %self.interface, "interface settings changed, cycling server");
            self.down().await?;
            self.write_config(rendered)?;
            return self.up().await;
        }

        self.state = ServerState::Reloading;
        self.write_config(rendered)?;
        match self.sync().await {
            Ok(()) => {
                self.state = ServerState::Up;
                info!(interface = %self.interface, peers = next.peers.len(), "server config reloaded");
                Ok(())
            }
            Err(e) => {
                self.state = ServerState::Up;
                Err(e)
            }
        }
    }

    async fn down(&mut self) -> Result<()> {
        if self.state == ServerState::Down || self.state == ServerState::Configured {
            return Ok(());
        }
        info!(interface = %self.interface, "bringing down server interface");
        if let Err(e) = self.wg_quick("down").await {
            warn!(interface = %self.interface, error = %e, "wg-quick down failed");
        }
        self.state = ServerState::Down;
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        let alive = self
            .command(AllowedProgram::Wg)
            .arg("show")
            .arg(&self.interface)
            .execute_unchecked()
            .await
            .is_ok_and(|output| output.success());
        if !alive && self.state == ServerState::Up {
            self.state = ServerState::Down;
        }
        alive
    }

    fn state(&self) -> ServerState {
        self.state
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

#[derive(Debug, Default)]
struct FakeServerControl {
    running: bool,
    fail_up: bool,
    ups: u32,
    downs: u32,
    reloads: u32,
    failing_reloads: u32,
    applied: Option<String>,
}

/// In-memory [`ModernServer`] for tests. Clones share one control block.
#[derive(Debug, Clone)]
pub struct FakeModernServer {
    interface: String,
    control: Arc<RwLock<FakeServerControl>>,
    written: Option<String>,
    state: ServerState,
}

impl FakeModernServer {
    /// A server that comes up on request.
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            control: Arc::new(RwLock::new(FakeServerControl::default())),
            written: None,
            state: ServerState::Down,
        }
    }

    /// A server whose activation always fails.
    #[must_use]
    pub fn failing(interface: impl Into<String>) -> Self {
        let server = Self::new(interface);
        if let Ok(mut control) = server.control.try_write() {
            control.fail_up = true;
        }
        server
    }

    /// Simulates the interface disappearing.
    pub async fn crash(&self) {
        self.control.write().await.running = false;
    }

    /// Number of successful `up` calls.
    pub async fn up_count(&self) -> u32 {
        self.control.read().await.ups
    }

    /// Number of `down` calls on a running interface.
    pub async fn down_count(&self) -> u32 {
        self.control.read().await.downs
    }

    /// Makes the next `count` reloads fail without touching the interface.
    pub async fn fail_next_reloads(&self, count: u32) {
        self.control.write().await.failing_reloads = count;
    }

    /// Number of successful `reload` calls.
    pub async fn reload_count(&self) -> u32 {
        self.control.read().await.reloads
    }

    /// The config the running interface was last given.
    pub async fn applied_config(&self) -> Option<String> {
        self.control.read().await.applied.clone()
    }

    /// Whether the simulated interface is up.
    pub async fn is_running(&self) -> bool {
        self.control.read().await.running
    }
}

impl ModernServer for FakeModernServer {
    async fn configure(&mut self, rendered: &str) -> Result<()> {
        parse_wg_config(rendered)?;
        self.written = Some(rendered.to_string());
        if self.state == ServerState::Down {
            self.state = ServerState::Configured;
        }
        Ok(())
    }

    async fn up(&mut self) -> Result<()> {
        let Some(ref config) = self.written else {
            return Err(BridgeError::activation(&self.interface, "no config"));
        };
        let mut control = self.control.write().await;
        if control.fail_up {
            self.state = ServerState::Down;
            return Err(BridgeError::activation(
                &self.interface,
                "RTNETLINK answers: Address already in use",
            ));
        }
        control.running = true;
        control.ups += 1;
        control.applied = Some(config.clone());
        self.state = ServerState::Up;
        Ok(())
    }

    async fn reload(&mut self, rendered: &str) -> Result<()> {
        parse_wg_config(rendered)?;
        let mut control = self.control.write().await;
        if control.failing_reloads > 0 {
            control.failing_reloads -= 1;
            return Err(BridgeError::activation(
                &self.interface,
                "Unable to modify interface: Resource busy",
            ));
        }
        self.written = Some(rendered.to_string());
        if self.state == ServerState::Up && control.running {
            control.reloads += 1;
            control.applied = Some(rendered.to_string());
        }
        Ok(())
    }

    async fn down(&mut self) -> Result<()> {
        let mut control = self.control.write().await;
        if control.running {
            control.running = false;
            control.downs += 1;
        }
        self.state = ServerState::Down;
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        let running = self.control.read().await.running;
        if !running && self.state == ServerState::Up {
            self.state = ServerState::Down;
        }
        running
    }

    fn state(&self) -> ServerState {
        self.state
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}
