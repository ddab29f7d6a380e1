//! Lock files guarding per-issue transitions, id allocation and trunk merges.
//!
//! A lock is a file created with `create_new`, holding the owner's PID and
//! acquisition time. Dropping the guard removes the file. Locks older than the
//! configured stale age are assumed abandoned by a crashed process and reclaimed.

use crate::error::{Result, TrellisError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
    purpose: String,
}

#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Take the lock or fail immediately with `Busy`.
    pub fn try_acquire(path: &Path, purpose: &str, stale_after: Duration) -> Result<Self> {
        match Self::create(path, purpose)? {
            Some(lock) => Ok(lock),
            None => {
                if Self::reclaim_if_stale(path, stale_after)? {
                    if let Some(lock) = Self::create(path, purpose)? {
                        return Ok(lock);
                    }
                }
                Err(TrellisError::Busy(describe_holder(path)))
            }
        }
    }

    /// Take the lock, polling until `wait` elapses.
    pub fn acquire(path: &Path, purpose: &str, wait: Duration, stale_after: Duration) -> Result<Self> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(25);
        loop {
            match Self::try_acquire(path, purpose, stale_after) {
                Ok(lock) => return Ok(lock),
                Err(TrellisError::Busy(holder)) => {
                    if start.elapsed() >= wait {
                        return Err(TrellisError::Busy(holder));
                    }
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(path: &Path, purpose: &str) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                    purpose: purpose.to_string(),
                };
                let data = serde_json::to_string(&owner)?;
                file.write_all(data.as_bytes())?;
                file.flush()?;
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(TrellisError::Io(e)),
        }
    }

    fn reclaim_if_stale(path: &Path, stale_after: Duration) -> Result<bool> {
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(TrellisError::Io(e)),
        };
        let age = modified.elapsed().unwrap_or_default();
        if age < stale_after {
            return Ok(false);
        }
        tracing::warn!(path = %path.display(), age_secs = age.as_secs(), "reclaiming stale lock");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(TrellisError::Io(e)),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn describe_holder(path: &Path) -> String {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<LockOwner>(&s).ok())
    {
        Some(owner) => format!(
            "{name} is locked by pid {} ({}) since {}",
            owner.pid,
            owner.purpose,
            owner.acquired_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => format!("{name} is locked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(600);

    #[test]
    fn second_acquire_is_busy_until_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks/FEAT-0001.lock");
        let first = FileLock::try_acquire(&path, "start", STALE).unwrap();
        let err = FileLock::try_acquire(&path, "submit", STALE).unwrap_err();
        assert!(matches!(err, TrellisError::Busy(ref m) if m.contains("start")));
        drop(first);
        assert!(!path.exists());
        FileLock::try_acquire(&path, "submit", STALE).unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunk.lock");
        std::fs::write(&path, "garbage").unwrap();
        let lock = FileLock::try_acquire(&path, "close", Duration::ZERO).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn acquire_waits_then_gives_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunk.lock");
        let _held = FileLock::try_acquire(&path, "close", STALE).unwrap();
        let start = Instant::now();
        let err = FileLock::acquire(&path, "close", Duration::from_millis(100), STALE).unwrap_err();
        assert!(matches!(err, TrellisError::Busy(_)));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
