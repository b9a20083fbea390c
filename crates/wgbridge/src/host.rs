//! Host network setup.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use wgb_validation::{AllowedProgram, SafeCommand};

use crate::error::{BridgeError, Result};

/// Kernel settings the bridge needs to route between interfaces.
pub const FORWARDING_SETTINGS: [&str; 3] = [
    "net.ipv4.ip_forward=1",
    "net.ipv4.conf.all.forwarding=1",
    "net.ipv6.conf.all.forwarding=1",
];

/// The `sysctl` invocations that enable forwarding.
#[must_use]
pub fn forwarding_commands(use_sudo: bool) -> Vec<SafeCommand> {
    FORWARDING_SETTINGS
        .iter()
        .map(|setting| {
            SafeCommand::new(AllowedProgram::Sysctl)
                .privileged(use_sudo)
                .arg("-w")
                .arg(setting)
        })
        .collect()
}

/// Enables IP forwarding. Stops at the first failing setting.
///
/// # Errors
///
/// Returns the failing command's error.
pub async fn enable_ip_forwarding(use_sudo: bool) -> Result<()> {
    for command in forwarding_commands(use_sudo) {
        debug!(command = %command.command_description(), "applying");
        command.execute().await?;
    }
    info!("IP forwarding enabled");
    Ok(())
}

/// Prepares the host for bridging.
#[allow(async_fn_in_trait)]
pub trait HostSetup {
    /// Enables packet forwarding between interfaces.
    async fn enable_forwarding(&mut self) -> Result<()>;
}

/// [`HostSetup`] through `sysctl`.
#[derive(Debug, Clone, Copy)]
pub struct SysctlHost {
    use_sudo: bool,
}

impl SysctlHost {
    /// Creates a host setup that optionally prefixes `sudo`.
    #[must_use]
    pub const fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

impl HostSetup for SysctlHost {
    async fn enable_forwarding(&mut self) -> Result<()> {
        enable_ip_forwarding(self.use_sudo).await
    }
}

/// In-memory [`HostSetup`] for tests.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    calls: Arc<AtomicU32>,
    fail: bool,
}

impl FakeHost {
    /// A host where forwarding always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A host where enabling forwarding fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of `enable_forwarding` calls.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HostSetup for FakeHost {
    async fn enable_forwarding(&mut self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BridgeError::config("sysctl: permission denied"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_commands() {
        let descriptions: Vec<String> = forwarding_commands(true)
            .iter()
            .map(SafeCommand::command_description)
            .collect();
        assert_eq!(
            descriptions,
            vec![
                "sudo sysctl -w net.ipv4.ip_forward=1",
                "sudo sysctl -w net.ipv4.conf.all.forwarding=1",
                "sudo sysctl -w net.ipv6.conf.all.forwarding=1",
            ]
        );
    }

    #[test]
    fn test_forwarding_commands_without_sudo() {
        let commands = forwarding_commands(false);
        assert!(commands.iter().all(|c| !c.command_description().starts_with("sudo")));
        assert!(commands.iter().all(|c| !c.has_errors()));
    }

    #[tokio::test]
    async fn test_fake_host_counts_calls() {
        let host = FakeHost::new();
        let mut driven = host.clone();
        driven.enable_forwarding().await.expect("ok");
        assert_eq!(host.calls(), 1);
        assert!(FakeHost::failing().enable_forwarding().await.is_err());
    }
}
