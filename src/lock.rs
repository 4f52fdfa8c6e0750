//! Single-instance guard. Two pollers sharing the same baseline and log files
//! would race each other, so startup claims a PID file first.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum PidLockError {
    #[error("Another instance is already running (PID: {pid}, lock file {path})")]
    AlreadyLocked { pid: u32, path: PathBuf },

    #[error("Failed to write lock file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PidLock {
    /// Claim the lock file for this process. A file left behind by a process
    /// that is no longer running is replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidLockError> {
        let path = path.into();

        if let Some(existing) = read_pid(&path) {
            if is_process_alive(existing) {
                return Err(PidLockError::AlreadyLocked { pid: existing, path });
            }
            warn!(pid = existing, path = %path.display(), "Replacing stale lock file");
            let _ = fs::remove_file(&path);
        }

        let write_failed = |source| PidLockError::WriteFailed {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }
        let pid = std::process::id();
        fs::write(&path, pid.to_string()).map_err(write_failed)?;

        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // Only remove the file while it still names us.
        if read_pid(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

fn is_process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    #[cfg(unix)]
    {
        // `kill -0` checks for existence without delivering a signal.
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    #[cfg(not(unix))]
    {
        false
    }
}
