//! Process-wide run lock
//!
//! Serialises renewal runs across processes (cron and the daemon loop can
//! overlap). A run that finds the lock taken is skipped, never queued.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CertError, Result};

/// Held `flock` on the lock file; released on drop
pub struct RunLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without blocking. `Ok(None)` means another run holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    CertError::Lock(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| CertError::Lock(format!("Failed to open {}: {}", path.display(), e)))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(path = ?path, "Run lock acquired");
                Ok(Some(Self {
                    _lock: lock,
                    path: path.to_path_buf(),
                }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(CertError::Lock(format!(
                "flock on {} failed: {}",
                path.display(),
                errno
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
