//! Single-instance lock, per `spec.md` §4.11.
//!
//! Grounded on this repo's exclusive-create idiom in `src/io.rs`
//! (`File::create` + rename for atomicity); here the exclusivity itself
//! comes from `OpenOptions::create_new`, which fails if the file already
//! exists rather than truncating it.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors raised while acquiring the single-instance lock.
#[derive(Debug)]
pub enum LockError {
    /// Another instance already holds the lock file.
    AlreadyHeld,
    /// Underlying filesystem failure unrelated to contention.
    Io(std::io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyHeld => write!(f, "lock file already held by another process"),
            Self::Io(err) => write!(f, "lock I/O error: {err}"),
        }
    }
}

impl std::error::Error for LockError {}

/// An acquired single-instance lock. Removes its lock file on `Drop`, so a
/// clean shutdown never leaves a stale lock behind.
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Attempts to acquire the lock at `path`, writing the current process
    /// id into the file. Returns `LockError::AlreadyHeld` if another
    /// process's lock file is present — callers should print a concise
    /// message and exit 0, never treat this as a crash.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LockError::AlreadyHeld)
            }
            Err(err) => return Err(LockError::Io(err)),
        };
        write!(file, "{}", std::process::id()).map_err(LockError::Io)?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freqrelay.lock");
        let first = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(matches!(second, Err(LockError::AlreadyHeld)));
        drop(first);
    }

    #[test]
    fn lock_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freqrelay.lock");
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn reacquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freqrelay.lock");
        drop(InstanceLock::acquire(&path).unwrap());
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
