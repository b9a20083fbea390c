//! wgbridge - WireGuard to OpenVPN bridge
//!
//! Runs the full bridge lifecycle, answers the container health probe, and
//! manages peers while the bridge is running.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgbridge::sequencer::describe_failure;
use wgbridge::supervisor::spawn_signal_listener;
use wgbridge::{
    admin, health_check, BridgeConfig, BridgeError, OpenVpnClient, Sequencer, Supervisor,
    SysctlHost, WgQuickServer,
};

#[derive(Parser)]
#[command(name = "wgbridge")]
#[command(about = "Bridge WireGuard peers through an OpenVPN client tunnel")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start both daemons and supervise them (default)
    Run,

    /// Exit 0 if the running bridge reports healthy
    HealthCheck,

    /// Add a client and print its config
    AddClient {
        /// Client name (letters, digits, '-', '_')
        name: String,
    },

    /// Print an existing client's config
    ShowClient {
        /// Client name
        name: String,
    },

    /// List clients with a rendered config
    ListClients,
}

/// Settings that override [`BridgeConfig::default`].
#[derive(Debug, Default, Args)]
struct ConfigArgs {
    /// Server interface name
    #[arg(long, env = "CONFIG_NAME", global = true)]
    config_name: Option<String>,

    /// Server listen port
    #[arg(long, env = "WG_PORT", global = true)]
    wg_port: Option<u16>,

    /// Address range for the server and peers
    #[arg(long, env = "WG_ADDRESS_RANGE", global = true)]
    wg_address_range: Option<String>,

    /// Comma-separated client names, or a count
    #[arg(long, env = "WG_CLIENTS", global = true)]
    wg_clients: Option<String>,

    /// Host written into client configs
    #[arg(long, env = "PUBLIC_IP", global = true)]
    public_ip: Option<String>,

    /// Directory holding the OpenVPN client config
    #[arg(long, env = "OPENVPN_CONFIG_DIR", global = true)]
    openvpn_config_dir: Option<PathBuf>,

    /// Directory for the OpenVPN log
    #[arg(long, env = "OPENVPN_LOG_DIR", global = true)]
    openvpn_log_dir: Option<PathBuf>,

    /// OpenVPN verbosity (0-9)
    #[arg(long, env = "OPENVPN_LOG_LEVEL", global = true)]
    openvpn_log_level: Option<u8>,

    /// Extra OpenVPN arguments, whitespace separated
    #[arg(long, env = "OPENVPN_ADDITIONAL_ARGS", global = true, allow_hyphen_values = true)]
    openvpn_additional_args: Option<String>,

    /// User and group OpenVPN drops to
    #[arg(long, env = "BRIDGE_USER", global = true)]
    bridge_user: Option<String>,

    /// Keys, client configs and server config
    #[arg(long, env = "WIREGUARD_DIR", global = true)]
    wireguard_dir: Option<PathBuf>,

    /// Status document path
    #[arg(long, env = "STATUS_FILE", global = true)]
    status_file: Option<PathBuf>,

    /// Seconds to wait for the tunnel interface
    #[arg(long, env = "TUNNEL_TIMEOUT", global = true)]
    tunnel_timeout: Option<u64>,

    /// Seconds between health ticks
    #[arg(long, env = "HEALTH_INTERVAL", global = true)]
    health_interval: Option<u64>,

    /// Seconds after which the status document is stale
    #[arg(long, env = "STATUS_MAX_AGE", global = true)]
    status_max_age: Option<u64>,

    /// Routes pushed to clients
    #[arg(long, env = "WG_CLIENT_ALLOWED_IPS", global = true)]
    wg_client_allowed_ips: Option<String>,

    /// Keepalive written into client configs
    #[arg(long, env = "WG_PERSISTENT_KEEPALIVE", global = true)]
    wg_persistent_keepalive: Option<u16>,

    /// Prefix privileged tools with sudo
    #[arg(long, env = "BRIDGE_USE_SUDO", global = true)]
    use_sudo: Option<bool>,
}

impl ConfigArgs {
    fn into_config(self) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        if let Some(v) = self.config_name {
            config.config_name = v;
        }
        if let Some(v) = self.wg_port {
            config.listen_port = v;
        }
        if let Some(v) = self.wg_address_range {
            config.address_range = v;
        }
        if let Some(v) = self.wg_clients {
            config.clients = v;
        }
        config.public_ip = self.public_ip.filter(|v| !v.trim().is_empty());
        if let Some(v) = self.openvpn_config_dir {
            config.openvpn_config_dir = v;
        }
        if let Some(v) = self.openvpn_log_dir {
            config.openvpn_log_dir = v;
        }
        config.openvpn_log_level = self.openvpn_log_level;
        if let Some(v) = self.openvpn_additional_args {
            config.openvpn_additional_args = v.split_whitespace().map(str::to_string).collect();
        }
        config.run_as = self.bridge_user.filter(|v| !v.trim().is_empty());
        if let Some(v) = self.wireguard_dir {
            config.wireguard_dir = v;
        }
        if let Some(v) = self.status_file {
            config.status_file = v;
        }
        if let Some(v) = self.tunnel_timeout {
            config.tunnel_timeout_secs = v;
        }
        if let Some(v) = self.health_interval {
            config.health_interval_secs = v;
        }
        if let Some(v) = self.status_max_age {
            config.status_max_age_secs = v;
        }
        if let Some(v) = self.wg_client_allowed_ips {
            config.client_allowed_ips = v;
        }
        if let Some(v) = self.wg_persistent_keepalive {
            config.persistent_keepalive = v;
        }
        if let Some(v) = self.use_sudo {
            config.use_sudo = v;
        }
        config
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => EnvFilter::try_new(level.trim().to_lowercase())?,
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wgbridge=info")),
    };

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing()?;

    let config = cli.config.into_config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bridge(config).await,
        Commands::HealthCheck => {
            let verdict = health_check(
                &config.status_file,
                std::time::Duration::from_secs(config.status_max_age_secs),
            );
            println!("{verdict}");
            Ok(if verdict.is_healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::AddClient { name } => {
            config.validate()?;
            let rendered = admin::add_client(&config, &name).await?;
            print!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::ShowClient { name } => {
            let rendered = admin::show_client(&config, &name)?;
            print!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::ListClients => {
            for name in admin::list_clients(&config)? {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> anyhow::Result<ExitCode> {
    info!(
        config_name = %config.config_name,
        listen_port = config.listen_port,
        address_range = %config.address_range,
        "starting wgbridge"
    );

    let sequencer = Sequencer::new(
        config.clone(),
        SysctlHost::new(config.use_sudo),
        OpenVpnClient::new(&config),
        WgQuickServer::new(&config),
    )?;

    // one receiver spans startup and supervision so no signal is lost between them
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    spawn_signal_listener(shutdown_tx);

    let startup = sequencer.run_until(async {
        let _ = shutdown_rx.recv().await;
    });
    let bridge = match startup.await {
        Ok(bridge) => bridge,
        Err(e) if matches!(e.source, BridgeError::Interrupted) => {
            warn!(phase = e.phase.number(), "startup interrupted, components stopped");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            error!(phase = e.phase.number(), "{}", describe_failure(&e));
            return Ok(ExitCode::FAILURE);
        }
    };

    Supervisor::new(bridge)
        .run_until(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(ExitCode::SUCCESS)
}
