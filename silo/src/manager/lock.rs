//! Manager root directory lock.
//!
//! flock-based guard so two managers cannot share one state directory;
//! released automatically when the manager (or its process) goes away.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use silo_shared::{SiloError, SiloResult};

/// Exclusive lock on a manager root, held for the manager's lifetime.
#[derive(Debug)]
pub struct ManagerLock {
    #[allow(dead_code)] // held for its lifetime, not accessed
    file: File,
    path: PathBuf,
}

impl ManagerLock {
    /// Acquire the lock, creating the directory if needed. Fails when
    /// another manager already owns the directory.
    pub fn acquire(root: &Path) -> SiloResult<ManagerLock> {
        std::fs::create_dir_all(root)
            .map_err(|e| SiloError::Io(format!("failed to create {}: {}", root.display(), e)))?;
        let lock_path = root.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| SiloError::Io(format!("failed to open lock file: {}", e)))?;

        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(SiloError::InvalidState(format!(
                    "another manager already owns {}",
                    root.display()
                )));
            }
            return Err(SiloError::Io(format!("failed to acquire lock: {}", err)));
        }

        tracing::debug!(lock = %lock_path.display(), "acquired manager lock");
        Ok(ManagerLock {
            file,
            path: lock_path,
        })
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManagerLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(lock = %self.path.display(), "released manager lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_reacquire_after_drop() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let _lock = ManagerLock::acquire(tmp.path()).unwrap();
        }
        let _lock = ManagerLock::acquire(tmp.path()).unwrap();
    }

    #[test]
    fn test_second_manager_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let _lock = ManagerLock::acquire(tmp.path()).unwrap();
        let err = ManagerLock::acquire(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("already owns"));
    }

    #[test]
    fn test_different_roots_independent() {
        let tmp1 = tempfile::tempdir().unwrap();
        let tmp2 = tempfile::tempdir().unwrap();
        let _lock1 = ManagerLock::acquire(tmp1.path()).unwrap();
        let _lock2 = ManagerLock::acquire(tmp2.path()).unwrap();
    }
}
