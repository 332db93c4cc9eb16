//! Exclusive-create lock files (`<target>.lock`).
//!
//! A lock is taken by creating `<target>.lock` with `O_EXCL`. The new content
//! is written into the lock file and published by renaming it over the
//! target, so readers see either the old or the new content. Dropping an
//! uncommitted lock deletes it. A lock left behind by a crashed process stays
//! on disk and makes later acquisitions fail until someone removes it.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::StoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusively held `<target>.lock` file.
#[derive(Debug)]
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Try once to take the lock for `target`.
    ///
    /// # Errors
    /// Returns [`StoreError::Locked`] if the lock file already exists, or an
    /// I/O error if it could not be created.
    pub fn acquire(target: &Path) -> Result<Self, StoreError> {
        Self::acquire_with_timeout(target, Duration::ZERO)
    }

    /// Take the lock for `target`, polling until `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`StoreError::Locked`] if the lock is still held when the
    /// timeout expires.
    pub fn acquire_with_timeout(target: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(file) => {
                    debug!(lock = %lock_path.display(), "lock acquired");
                    return Ok(Self {
                        target: target.to_path_buf(),
                        lock_path,
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        warn!(lock = %lock_path.display(), "lock contention");
                        return Err(StoreError::Locked { path: lock_path });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The path being protected.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The `.lock` file itself.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Write `data` into the lock file and rename it over the target.
    ///
    /// # Errors
    /// Returns an I/O error if writing, syncing or renaming fails; the lock
    /// file is removed in that case.
    pub fn commit(mut self, data: &[u8]) -> Result<(), StoreError> {
        let Some(file) = self.file.take() else {
            return Err(StoreError::Locked {
                path: self.lock_path.clone(),
            });
        };
        if let Err(e) = publish(file, data, &self.lock_path, &self.target) {
            let _ = fs::remove_file(&self.lock_path);
            return Err(e.into());
        }
        debug!(target = %self.target.display(), "lock committed");
        Ok(())
    }

    /// Delete the target and release the lock.
    ///
    /// # Errors
    /// Returns an I/O error if the target exists but cannot be removed.
    pub fn commit_delete(self) -> Result<(), StoreError> {
        match fs::remove_file(&self.target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

fn publish(mut file: File, data: &[u8], from: &Path, to: &Path) -> std::io::Result<()> {
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(from, to)
}

/// `<target>.lock`.
#[must_use]
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.json");
        fs::write(&target, b"old").unwrap();

        let lock = LockFile::acquire(&target).unwrap();
        assert!(lock.lock_path().exists());
        lock.commit(b"new").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!lock_path_for(&target).exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("HEAD");
        let _held = LockFile::acquire(&target).unwrap();
        let err = LockFile::acquire(&target).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
    }

    #[test]
    fn drop_releases_without_touching_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("HEAD");
        fs::write(&target, b"keep").unwrap();
        {
            let _lock = LockFile::acquire(&target).unwrap();
        }
        assert_eq!(fs::read(&target).unwrap(), b"keep");
        assert!(LockFile::acquire(&target).is_ok());
    }

    #[test]
    fn stale_lock_blocks_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.json");
        fs::write(lock_path_for(&target), b"").unwrap();

        let start = Instant::now();
        let err = LockFile::acquire_with_timeout(&target, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));

        fs::remove_file(lock_path_for(&target)).unwrap();
        assert!(LockFile::acquire(&target).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.json");
        let held = LockFile::acquire(&target).unwrap();
        let t = target.clone();
        let waiter = std::thread::spawn(move || {
            LockFile::acquire_with_timeout(&t, Duration::from_secs(5)).is_ok()
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
