//! Crash-safe file writes.
//!
//! Material is written to a temp file next to its destination, synced, and
//! renamed into place, so a reader only ever sees the old or the new content.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use crate::error::{BridgeError, Result};

/// Owner read/write only.
pub const MODE_SECRET: u32 = 0o600;
/// Owner read/write, world readable.
pub const MODE_PUBLIC: u32 = 0o644;

/// Writes `bytes` to `path` atomically with the given permission bits.
///
/// Missing parent directories are created.
///
/// # Errors
///
/// Returns [`BridgeError::Io`] naming the path that failed.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| BridgeError::config(format!("path {} has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| BridgeError::io(parent, e))?;

    let temp = temp_path_for(path);
    let result = write_temp(&temp, bytes, mode).and_then(|()| {
        fs::rename(&temp, path).map_err(|e| BridgeError::io(path, e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp);
        return result;
    }

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn write_temp(temp: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(mode);
    }
    let mut file = options.open(temp).map_err(|e| BridgeError::io(temp, e))?;
    file.write_all(bytes).map_err(|e| BridgeError::io(temp, e))?;
    // umask may have narrowed the creation mode
    #[cfg(unix)]
    {
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| BridgeError::io(temp, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    file.sync_all().map_err(|e| BridgeError::io(temp, e))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut out = path.as_os_str().to_os_string();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    out.push(format!(".tmp.{}.{stamp}", std::process::id()));
    PathBuf::from(out)
}

/// Reads `path` as UTF-8, returning `None` if it does not exist.
///
/// # Errors
///
/// Returns [`BridgeError::Io`] for any failure other than absence.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BridgeError::io(path, e)),
    }
}

/// Removes `path`, treating absence as success.
///
/// # Errors
///
/// Returns [`BridgeError::Io`] for any failure other than absence.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BridgeError::io(path, e)),
    }
}
