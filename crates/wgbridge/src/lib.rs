//! wgbridge - WireGuard to OpenVPN bridge orchestrator
//!
//! Accepts WireGuard peers and forwards their traffic through an OpenVPN
//! client tunnel. The crate sequences startup of both daemons, keeps key
//! material stable across restarts, supervises both daemons, and lets
//! operators add peers while the bridge is running.
//!
//! # Example
//!
//! ```rust,no_run
//! use wgbridge::{BridgeConfig, OpenVpnClient, Sequencer, Supervisor, SysctlHost, WgQuickServer};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BridgeConfig::default();
//! let bridge = Sequencer::new(
//!     config.clone(),
//!     SysctlHost::new(config.use_sudo),
//!     OpenVpnClient::new(&config),
//!     WgQuickServer::new(&config),
//! )?
//! .run()
//! .await?;
//!
//! Supervisor::new(bridge).run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod legacy;
pub mod lock;
pub mod persist;
pub mod sequencer;
pub mod server;
pub mod state;
pub mod status;
pub mod store;
pub mod supervisor;

pub use config::BridgeConfig;
pub use error::{BridgeError, Phase, Result, StartupError};
pub use host::{FakeHost, HostSetup, SysctlHost};
pub use legacy::{ClientState, FakeTunnelClient, OpenVpnClient, TunnelClient, TunnelInfo};
pub use sequencer::{RunningBridge, Sequencer};
pub use server::{FakeModernServer, ModernServer, ServerState, WgQuickServer};
pub use state::{BridgeState, SetupInfo, SharedState};
pub use status::{health_check, HealthVerdict, StatusDocument};
pub use store::{MaterialStore, PeerIdentity, ServerIdentity};
pub use supervisor::{Supervisor, TickReport};
