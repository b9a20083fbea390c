//! Runtime admin operations.
//!
//! These run in a short-lived process next to the supervisor. They change
//! the store under the store lock and leave a marker that the supervisor
//! picks up on its next tick.

use std::fs;

use tracing::info;
use wgb_validation::sanitize_peer_name;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lock::{StoreLock, DEFAULT_LOCK_TIMEOUT};
use crate::persist::{write_atomic, MODE_SECRET};
use crate::state::SetupInfo;
use crate::store::MaterialStore;

/// Adds a peer and returns its rendered config.
///
/// The running server picks the peer up with a reload; existing peers are
/// not disturbed.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidName`], [`BridgeError::DuplicateName`] or
/// [`BridgeError::RangeExhausted`] for bad input,
/// [`BridgeError::SetupInfoMissing`] if the bridge has never started, and
/// [`BridgeError::ServerKeysMissing`] if the server keys were removed.
pub async fn add_client(config: &BridgeConfig, name: &str) -> Result<String> {
    let name = sanitize_peer_name(name).map_err(BridgeError::InvalidName)?;
    let name = name.as_str();

    let setup = SetupInfo::load(&config.setup_info_path())?;
    let store = MaterialStore::new(config)?;

    let _lock = StoreLock::acquire(&config.lock_path(), DEFAULT_LOCK_TIMEOUT).await?;

    let server = store.load_server_identity()?;
    if server.public_key().to_base64() != setup.server_public_key {
        return Err(BridgeError::config(
            "server key does not match setup info; restart the bridge before adding clients",
        ));
    }

    let peer = store.add_peer(name)?;
    let rendered = store.render_peer_config(&peer, server.public_key(), &setup.endpoint);
    let path = store.write_peer_config(name, &rendered)?;

    let marker = config.reload_marker_path();
    write_atomic(&marker, name.as_bytes(), MODE_SECRET)?;

    info!(
        peer = %name,
        address = %peer.address,
        path = %path.display(),
        "client added, server will reload on next health tick"
    );
    Ok(rendered)
}

/// Returns the rendered config of an existing peer.
///
/// # Errors
///
/// Returns [`BridgeError::PeerNotFound`] if the peer is unknown or has no
/// config yet.
pub fn show_client(config: &BridgeConfig, name: &str) -> Result<String> {
    let name = sanitize_peer_name(name).map_err(BridgeError::InvalidName)?;
    let store = MaterialStore::new(config)?;
    let peer = store.peer(name.as_str())?;
    store.read_peer_config(&peer.name)
}

/// Names of every peer with a rendered config, sorted.
///
/// # Errors
///
/// Returns an error if the clients directory exists but cannot be read.
pub fn list_clients(config: &BridgeConfig) -> Result<Vec<String>> {
    let dir = config.clients_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BridgeError::io(&dir, e)),
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|e| e == "conf"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}
