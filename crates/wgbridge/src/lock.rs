//! Cross-process lock over the material store.
//!
//! The supervisor and admin invocations are separate processes, so the lock is
//! a file created with `create_new`. It carries the holder's pid; a lock whose
//! holder no longer exists is broken instead of waited on.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Default time to wait for the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held lock. The lock file is removed on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    _handle: File,
}

impl StoreLock {
    /// Acquires the lock at `path`, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Lock`] on timeout, or [`BridgeError::Io`] if the
    /// lock file cannot be created for another reason.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BridgeError::io(parent, e))?;
        }

        loop {
            match try_create(path) {
                Ok(handle) => {
                    debug!(path = %path.display(), "store lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _handle: handle,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if holder_is_gone(path) {
                        warn!(path = %path.display(), "breaking stale store lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                }
                Err(e) => return Err(BridgeError::io(path, e)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(BridgeError::Lock {
                    path: path.to_path_buf(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn try_create(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut handle = options.open(path)?;
    let stamp = format!("pid={}\n", std::process::id());
    let _ = handle.write_all(stamp.as_bytes());
    let _ = handle.sync_all();
    Ok(handle)
}

fn holder_pid(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
}

fn holder_is_gone(path: &Path) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        return false;
    }
    // an unreadable or half-written stamp is treated as live until timeout
    holder_pid(path).is_some_and(|pid| !proc_root.join(pid.to_string()).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".bridge.lock");
        {
            let lock = StoreLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)
                .await
                .expect("acquire");
            assert!(lock.path().exists());
            let stamp = fs::read_to_string(&path).expect("read");
            assert_eq!(stamp, format!("pid={}\n", std::process::id()));
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".bridge.lock");
        let _held = StoreLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)
            .await
            .expect("acquire");
        let err = StoreLock::acquire(&path, Duration::from_millis(120))
            .await
            .expect_err("should time out");
        assert!(matches!(err, BridgeError::Lock { .. }));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".bridge.lock");
        let held = StoreLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)
            .await
            .expect("acquire");

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            StoreLock::acquire(&waiter_path, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        let lock = waiter.await.expect("join").expect("acquire after release");
        assert!(lock.path().exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".bridge.lock");
        // pid_max is well below this on any Linux host
        fs::write(&path, "pid=4294967\n").expect("write");
        let lock = StoreLock::acquire(&path, Duration::from_secs(1))
            .await
            .expect("stale lock broken");
        assert!(lock.path().exists());
    }
}
