//! Single-instance lock for the master.
//!
//! Two masters on one data directory would fight over the control socket
//! and the TUN interface, so the master holds an `flock` for its lifetime.

use crate::error::{MeshError, MeshResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Lock file name inside the data directory.
pub const LOCK_FILE_NAME: &str = "tunnel-mesh.lock";

/// Held exclusive lock; released when dropped.
pub struct MasterLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

impl MasterLock {
    /// Acquire the lock in `data_dir`, failing if another master holds it.
    pub fn acquire(data_dir: &Path) -> MeshResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            MeshError::Config(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        let path = data_dir.join(LOCK_FILE_NAME);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| MeshError::Config(format!("Failed to open lock file: {}", e)))?;

        // SAFETY: flock on a descriptor owned by `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(MeshError::Config(format!(
                "Another master is already running on {}",
                data_dir.display()
            )));
        }

        // Record the holder's pid for debugging; only after the lock is ours.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        log::debug!("Acquired master lock: {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MasterLock {
    fn drop(&mut self) {
        // The file is left in place; unlinking would race a new holder.
        log::debug!("Released master lock: {}", self.path.display());
    }
}
