//! Scoped ownership of the index.
//!
//! Every mutating operation starts by taking [`IndexGuard`], which creates
//! `index.json.lock` exclusively and reads the index under it. Dropping the guard
//! without calling [`IndexGuard::commit`] removes the lock and leaves the old
//! index in place. A process that dies while holding it leaves the `.lock`
//! file behind; the next operation fails with
//! [`KeelError::LockContention`] until it is removed, and [`stale_locks`]
//! lists such files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_store::LockFile;
use tracing::debug;

use crate::error::KeelResult;
use crate::index::Index;

/// Exclusive access to the index for the duration of one operation.
#[derive(Debug)]
pub struct IndexGuard {
    lock: LockFile,
    index: Index,
}

impl IndexGuard {
    /// Lock `index_path` and load the index it guards.
    ///
    /// # Errors
    /// Returns [`KeelError::LockContention`](crate::KeelError::LockContention)
    /// if the lock is still held after `timeout`, or a state error if the
    /// index is unreadable.
    pub fn acquire(index_path: &Path, timeout: Duration) -> KeelResult<Self> {
        let lock = LockFile::acquire_with_timeout(index_path, timeout)?;
        debug!(lock = %lock.lock_path().display(), "index lock acquired");
        let index = Index::load(index_path)?;
        Ok(Self { lock, index })
    }

    #[must_use]
    pub const fn index(&self) -> &Index {
        &self.index
    }

    pub const fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    /// Swap in a whole new index.
    pub fn replace(&mut self, index: Index) {
        self.index = index;
    }

    /// Write the index and release the lock.
    ///
    /// # Errors
    /// Returns an error if serialization or the rename fails; the lock is
    /// released either way.
    pub fn commit(self) -> KeelResult<()> {
        let bytes = self.index.to_bytes()?;
        self.lock.commit(&bytes)?;
        debug!("index written");
        Ok(())
    }
}

/// Every `*.lock` file under `meta_dir`, sorted. Outside a running operation
/// these are left over from a crash.
///
/// # Errors
/// Returns an I/O error if a directory cannot be listed.
pub fn stale_locks(meta_dir: &Path) -> KeelResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_locks(meta_dir, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_locks(dir: &Path, found: &mut Vec<PathBuf>) -> KeelResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_locks(&path, found)?;
        } else if path.extension().is_some_and(|ext| ext == "lock") {
            found.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeelError;
    use crate::index::StagedBlob;
    use keel_store::{EntryMode, ObjectId};

    #[test]
    fn commit_persists_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut guard = IndexGuard::acquire(&path, Duration::ZERO).unwrap();
        guard.index_mut().set_resolved(
            "a",
            StagedBlob::new(ObjectId::for_blob(b"a"), EntryMode::Blob),
        );
        guard.commit().unwrap();

        let again = IndexGuard::acquire(&path, Duration::ZERO).unwrap();
        assert!(again.index().contains("a"));
    }

    #[test]
    fn drop_discards_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let mut guard = IndexGuard::acquire(&path, Duration::ZERO).unwrap();
            guard.index_mut().set_resolved(
                "a",
                StagedBlob::new(ObjectId::for_blob(b"a"), EntryMode::Blob),
            );
        }
        assert!(Index::load(&path).unwrap().is_empty());
        assert!(stale_locks(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn held_lock_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let _held = IndexGuard::acquire(&path, Duration::ZERO).unwrap();
        let err = IndexGuard::acquire(&path, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, KeelError::LockContention { .. }), "{err}");
    }

    #[test]
    fn stale_locks_found_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        std::fs::write(dir.path().join("index.json.lock"), b"").unwrap();
        std::fs::write(dir.path().join("refs/heads/main.lock"), b"").unwrap();
        std::fs::write(dir.path().join("refs/heads/main"), b"").unwrap();

        let locks = stale_locks(dir.path()).unwrap();
        assert_eq!(
            locks,
            vec![
                dir.path().join("index.json.lock"),
                dir.path().join("refs/heads/main.lock"),
            ]
        );
    }
}
