//! System-wide run locks.
//!
//! At most one backup and one restore may run at a time. A second invocation
//! fails fast instead of queueing. The lock file holds the owner's PID so a
//! lock left behind by a killed process can be reclaimed.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::utils::errors::{Result, StateguardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        }
    }
}

/// Held for the duration of a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path, operation: Operation) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{}.lock", operation.as_str()));

        match try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(StateguardError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_owner(&path) {
                    Some(pid) if !is_alive(pid) => {
                        warn!(
                            lock = %path.display(),
                            pid,
                            "Reclaiming stale {} lock",
                            operation.as_str()
                        );
                        fs::remove_file(&path)?;
                        try_create(&path).map_err(|_| busy(operation, None))
                    }
                    owner => Err(busy(operation, owner)),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

fn try_create(path: &Path) -> Result<RunLock> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(RunLock {
        path: path.to_path_buf(),
    })
}

fn read_owner(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn busy(operation: Operation, owner: Option<i32>) -> StateguardError {
    let detail = match owner {
        Some(pid) => format!("a {} run is active (pid {})", operation.as_str(), pid),
        None => format!("a {} run is active", operation.as_str()),
    };
    StateguardError::Concurrency(detail)
}
