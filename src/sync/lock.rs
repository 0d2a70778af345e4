//! Advisory write lock for sync cycles
//!
//! One lock file per `.braid` directory serializes every write path to the
//! index/JSONL pair. The holder's pid, hostname and start time are written
//! into the file so a competing process can tell a live holder from a stale
//! one and reclaim the lock when the holder is gone.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Sync lock held by {holder}")]
    Held { holder: String },

    #[error("Lock IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of the process holding the lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            started_at: Utc::now(),
        }
    }

    pub fn describe(&self) -> String {
        format!("pid {} on {} since {}", self.pid, self.hostname, self.started_at.to_rfc3339())
    }
}

/// An exclusive advisory lock; released on drop
pub struct SyncLock {
    file: fs::File,
    path: PathBuf,
}

impl SyncLock {
    /// Acquires the lock, reclaiming it from a dead local holder
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match Self::try_acquire(path)? {
            Some(lock) => Ok(lock),
            None => {
                let holder = read_holder(path);

                // A holder on this host whose process is gone left a stale
                // file behind; the flock itself died with the process, so one
                // more attempt wins the race or reports the new holder.
                if let Some(ref h) = holder {
                    if h.hostname == gethostname::gethostname().to_string_lossy()
                        && !is_process_running(h.pid)
                    {
                        if let Some(lock) = Self::try_acquire(path)? {
                            return Ok(lock);
                        }
                    }
                }

                Err(LockError::Held {
                    holder: holder
                        .map(|h| h.describe())
                        .unwrap_or_else(|| "unknown process".to_string()),
                })
            }
        }
    }

    fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let holder = LockHolder::current();
        let mut file = file;
        file.set_len(0)?;
        let json = serde_json::to_string(&holder).unwrap_or_default();
        file.write_all(json.as_bytes())?;
        file.flush()?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Returns the lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Reads the holder identity out of a lock file, if readable
pub fn read_holder(path: &Path) -> Option<LockHolder> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Checks whether a process with the given PID is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_holder_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");

        let _lock = SyncLock::acquire(&path).unwrap();
        let holder = read_holder(&path).unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert!(!holder.hostname.is_empty());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");

        {
            let _lock = SyncLock::acquire(&path).unwrap();
        }
        // Reacquire after drop
        let _again = SyncLock::acquire(&path).unwrap();
    }

    #[test]
    fn current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn stale_holder_file_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");

        // A dead holder: valid file, no flock, bogus pid
        let dead = LockHolder {
            pid: u32::MAX - 1,
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            started_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&dead).unwrap()).unwrap();

        let lock = SyncLock::acquire(&path).unwrap();
        assert_eq!(read_holder(lock.path()).unwrap().pid, std::process::id());
    }
}
