//! End-to-end lifecycle tests over the fake controllers.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use wgbridge::{
    admin, health_check, BridgeConfig, BridgeError, FakeHost, FakeModernServer, FakeTunnelClient,
    HealthVerdict, MaterialStore, Phase, Sequencer, Supervisor,
};

fn test_config(dir: &Path, clients: &str) -> BridgeConfig {
    BridgeConfig {
        wireguard_dir: dir.join("wireguard"),
        status_file: dir.join("status.json"),
        clients: clients.to_string(),
        public_ip: Some("192.0.2.10".to_string()),
        tunnel_timeout_secs: 1,
        health_interval_secs: 1,
        ..BridgeConfig::default()
    }
}

async fn start(
    config: &BridgeConfig,
    tunnel: &FakeTunnelClient,
    server: &FakeModernServer,
) -> Supervisor<FakeTunnelClient, FakeModernServer> {
    let bridge = Sequencer::new(config.clone(), FakeHost::new(), tunnel.clone(), server.clone())
        .expect("sequencer")
        .run()
        .await
        .expect("startup");
    Supervisor::new(bridge)
}

#[tokio::test]
async fn test_addresses_follow_creation_order() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a,b,c");
    let server = FakeModernServer::new("wg0");
    let supervisor = start(&config, &FakeTunnelClient::new("tun0"), &server).await;

    let state = supervisor.state();
    let state = state.read().await;
    assert_eq!(state.server.address(), Ipv4Addr::new(10, 9, 0, 1));
    let assigned: Vec<_> = state.peers.iter().map(|p| (p.name.as_str(), p.address)).collect();
    assert_eq!(
        assigned,
        vec![
            ("a", Ipv4Addr::new(10, 9, 0, 2)),
            ("b", Ipv4Addr::new(10, 9, 0, 3)),
            ("c", Ipv4Addr::new(10, 9, 0, 4)),
        ]
    );

    let applied = server.applied_config().await.expect("applied");
    assert!(applied.contains("Address = 10.9.0.1/24"));
    assert!(applied.contains("AllowedIPs = 10.9.0.4/32"));
}

#[tokio::test]
async fn test_restart_reuses_keys_and_addresses() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a,b");

    let mut first = start(&config, &FakeTunnelClient::new("tun0"), &FakeModernServer::new("wg0")).await;
    let (server_key, peer_keys) = {
        let state = first.state();
        let state = state.read().await;
        (
            state.server.public_key().to_base64(),
            state
                .peers
                .iter()
                .map(|p| p.public_key().to_base64())
                .collect::<Vec<_>>(),
        )
    };
    let client_a = std::fs::read_to_string(config.wireguard_dir.join("clients/a.conf")).expect("read");
    first.shutdown().await.expect("shutdown");

    let second = start(&config, &FakeTunnelClient::new("tun0"), &FakeModernServer::new("wg0")).await;
    let state = second.state();
    let state = state.read().await;
    assert_eq!(state.server.public_key().to_base64(), server_key);
    let again: Vec<_> = state.peers.iter().map(|p| p.public_key().to_base64()).collect();
    assert_eq!(again, peer_keys);
    assert_eq!(
        std::fs::read_to_string(config.wireguard_dir.join("clients/a.conf")).expect("read"),
        client_a
    );
}

#[tokio::test]
async fn test_growing_client_list_keeps_existing_addresses() {
    let dir = TempDir::new().expect("tempdir");

    let mut first = start(
        &test_config(dir.path(), "a,b"),
        &FakeTunnelClient::new("tun0"),
        &FakeModernServer::new("wg0"),
    )
    .await;
    first.shutdown().await.expect("shutdown");

    let second = start(
        &test_config(dir.path(), "a,b,c"),
        &FakeTunnelClient::new("tun0"),
        &FakeModernServer::new("wg0"),
    )
    .await;
    let state = second.state();
    let state = state.read().await;
    let c = state.peers.iter().find(|p| p.name == "c").expect("c");
    assert_eq!(c.address, Ipv4Addr::new(10, 9, 0, 4));
    let a = state.peers.iter().find(|p| p.name == "a").expect("a");
    assert_eq!(a.address, Ipv4Addr::new(10, 9, 0, 2));
}

#[tokio::test]
async fn test_missing_upstream_config_activates_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a");
    let host = FakeHost::new();
    let server = FakeModernServer::new("wg0");

    let err = Sequencer::new(config.clone(), host.clone(), FakeTunnelClient::without_config(), server.clone())
        .expect("sequencer")
        .run()
        .await
        .expect_err("must fail");

    assert_eq!(err.phase, Phase::LegacyTunnel);
    assert!(matches!(err.source, BridgeError::NoConfigFound { .. }));
    assert_eq!(server.up_count().await, 0);
    assert!(!config.setup_info_path().exists());
    assert!(!config.status_file.exists());
}

#[tokio::test]
async fn test_tunnel_timeout_aborts_before_server() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a");
    let tunnel = FakeTunnelClient::never_connects();
    let server = FakeModernServer::new("wg0");

    let err = Sequencer::new(config, FakeHost::new(), tunnel.clone(), server.clone())
        .expect("sequencer")
        .run()
        .await
        .expect_err("must time out");

    assert_eq!(err.phase, Phase::LegacyTunnel);
    assert!(matches!(err.source, BridgeError::TunnelTimeout { timeout_secs: 1 }));
    assert!(!tunnel.is_running().await);
    assert_eq!(server.up_count().await, 0);
}

#[tokio::test]
async fn test_crashed_server_recovers_within_one_tick() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a");
    let tunnel = FakeTunnelClient::new("tun0");
    let server = FakeModernServer::new("wg0");
    let mut supervisor = start(&config, &tunnel, &server).await;

    supervisor.tick().await;
    assert!(health_check(&config.status_file, Duration::from_secs(15)).is_healthy());

    server.crash().await;
    let report = supervisor.tick().await;

    assert!(report.server_restarted);
    assert!(report.server_alive);
    assert!(server.is_running().await);
    assert_eq!(server.up_count().await, 2);
    assert!(supervisor.health_check());
    assert_eq!(tunnel.start_count().await, 1);
}

#[tokio::test]
async fn test_crashed_tunnel_recovers_within_one_tick() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a");
    let tunnel = FakeTunnelClient::new("tun0");
    let server = FakeModernServer::new("wg0");
    let mut supervisor = start(&config, &tunnel, &server).await;

    tunnel.crash().await;
    let report = supervisor.tick().await;

    assert!(report.tunnel_restarted);
    assert!(report.tunnel_alive);
    assert!(!report.tunnel_changed);
    assert_eq!(tunnel.start_count().await, 2);
    assert_eq!(server.down_count().await, 0);
}

#[tokio::test]
async fn test_unfinished_rebind_keeps_bridge_unhealthy() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a");
    let tunnel = FakeTunnelClient::new("tun0");
    let server = FakeModernServer::new("wg0");
    let mut supervisor = start(&config, &tunnel, &server).await;

    tunnel.crash().await;
    tunnel.set_next_interface("tun1").await;
    server.fail_next_reloads(2).await;

    for _ in 0..2 {
        let report = supervisor.tick().await;
        assert!(report.rebind_pending);
        assert!(matches!(
            health_check(&config.status_file, Duration::from_secs(15)),
            HealthVerdict::Unhealthy {
                tunnel_alive: true,
                server_alive: false,
            }
        ));
    }

    let report = supervisor.tick().await;
    assert!(report.reloaded);
    assert!(health_check(&config.status_file, Duration::from_secs(15)).is_healthy());
    let applied = server.applied_config().await.expect("applied");
    assert!(applied.contains("-o tun1 -j MASQUERADE"));
    assert_eq!(tunnel.start_count().await, 2);
}

#[tokio::test]
async fn test_shutdown_during_startup_leaves_nothing_running() {
    let dir = TempDir::new().expect("tempdir");
    let config = BridgeConfig {
        tunnel_timeout_secs: 60,
        ..test_config(dir.path(), "a")
    };
    let tunnel = FakeTunnelClient::never_connects();
    let server = FakeModernServer::new("wg0");
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(());
    });
    let err = Sequencer::new(config.clone(), FakeHost::new(), tunnel.clone(), server.clone())
        .expect("sequencer")
        .run_until(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .expect_err("interrupted");

    assert_eq!(err.phase, Phase::LegacyTunnel);
    assert!(matches!(err.source, BridgeError::Interrupted));
    assert!(!tunnel.is_running().await);
    assert_eq!(server.up_count().await, 0);
    assert!(!config.setup_info_path().exists());
}

#[tokio::test]
async fn test_add_client_is_applied_without_disruption() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a,b");
    let server = FakeModernServer::new("wg0");
    let mut supervisor = start(&config, &FakeTunnelClient::new("tun0"), &server).await;
    supervisor.tick().await;

    let rendered = admin::add_client(&config, "c").await.expect("add client");
    assert!(rendered.contains("Address = 10.9.0.4/24"));
    assert!(rendered.contains("Endpoint = 192.0.2.10:1195"));

    let report = supervisor.tick().await;
    assert!(report.reloaded);
    assert!(!report.server_restarted);
    assert_eq!(server.up_count().await, 1);
    assert_eq!(server.down_count().await, 0);
    assert_eq!(server.reload_count().await, 1);

    let applied = server.applied_config().await.expect("applied");
    for addr in ["10.9.0.2/32", "10.9.0.3/32", "10.9.0.4/32"] {
        assert!(applied.contains(addr), "missing {addr}");
    }

    let store = MaterialStore::new(&config).expect("store");
    let peers = store.load_peers().expect("peers");
    assert_eq!(peers[0].address, Ipv4Addr::new(10, 9, 0, 2));
    assert_eq!(peers[1].address, Ipv4Addr::new(10, 9, 0, 3));
    assert!(!config.reload_marker_path().exists());

    let quiet = supervisor.tick().await;
    assert!(!quiet.reloaded);
    assert_eq!(server.reload_count().await, 1);
}

#[tokio::test]
async fn test_add_client_when_range_is_full() {
    let dir = TempDir::new().expect("tempdir");
    let config = BridgeConfig {
        address_range: "10.9.0.0/30".to_string(),
        ..test_config(dir.path(), "a")
    };
    start(&config, &FakeTunnelClient::new("tun0"), &FakeModernServer::new("wg0")).await;

    let err = admin::add_client(&config, "b").await.expect_err("full");
    assert!(matches!(err, BridgeError::RangeExhausted { .. }));
    assert!(!config.reload_marker_path().exists());
    assert!(!config.wireguard_dir.join("clients/b.conf").exists());
}

#[tokio::test]
async fn test_shutdown_clears_status() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path(), "a");
    let tunnel = FakeTunnelClient::new("tun0");
    let server = FakeModernServer::new("wg0");
    let mut supervisor = start(&config, &tunnel, &server).await;
    supervisor.tick().await;
    assert!(config.status_file.exists());

    supervisor.shutdown().await.expect("shutdown");

    assert!(!tunnel.is_running().await);
    assert!(!server.is_running().await);
    assert!(matches!(
        health_check(&config.status_file, Duration::from_secs(15)),
        HealthVerdict::Missing
    ));
}
