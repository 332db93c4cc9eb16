//! The [`RefStore`] trait and its backends.
//!
//! Refs are mutable names pointing at objects (or, for symbolic refs, at
//! other refs). Every update is a compare-and-set against the value the
//! caller last observed, so two writers racing on the same ref cannot both
//! win.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::StoreError;
use crate::lockfile::LockFile;
use crate::types::{ObjectId, RefName, RefTarget, ReflogEntry};

/// Maximum number of symbolic hops followed by [`RefStore::resolve`].
pub const MAX_SYMREF_DEPTH: usize = 5;

/// The end of a symbolic ref chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRef {
    /// The last ref in the chain (the branch, when resolving `HEAD`).
    pub name: RefName,
    /// `None` when that ref does not exist yet (an unborn branch).
    pub target: Option<ObjectId>,
}

/// Mutable named pointers with compare-and-set updates.
pub trait RefStore {
    /// Read a ref's raw value without following symbolic links.
    fn read(&self, name: &RefName) -> Result<Option<RefTarget>, StoreError>;

    /// Set `name` to `new` if its current value equals `expected`.
    ///
    /// `expected = None` asserts the ref does not exist. On mismatch nothing
    /// changes and [`StoreError::RefConflict`] is returned.
    fn compare_and_set(
        &self,
        name: &RefName,
        expected: Option<&RefTarget>,
        new: &RefTarget,
    ) -> Result<(), StoreError>;

    /// Delete `name` if its current value equals `expected`.
    fn compare_and_delete(&self, name: &RefName, expected: &RefTarget) -> Result<(), StoreError>;

    /// All refs whose name starts with `prefix`, sorted by name.
    fn list(&self, prefix: &str) -> Result<Vec<(RefName, RefTarget)>, StoreError>;

    /// Append one entry to `name`'s history.
    fn append_reflog(&self, name: &RefName, entry: &ReflogEntry) -> Result<(), StoreError>;

    /// `name`'s history, oldest first.
    fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, StoreError>;

    /// Follow symbolic refs until a direct ref or a missing ref is reached.
    ///
    /// # Errors
    /// Returns [`StoreError::SymrefLoop`] after [`MAX_SYMREF_DEPTH`] hops.
    fn resolve(&self, name: &RefName) -> Result<ResolvedRef, StoreError> {
        let mut current = name.clone();
        for _ in 0..=MAX_SYMREF_DEPTH {
            match self.read(&current)? {
                Some(RefTarget::Symbolic(next)) => current = next,
                Some(RefTarget::Direct(oid)) => {
                    return Ok(ResolvedRef {
                        name: current,
                        target: Some(oid),
                    });
                }
                None => {
                    return Ok(ResolvedRef {
                        name: current,
                        target: None,
                    });
                }
            }
        }
        Err(StoreError::SymrefLoop {
            start: name.to_string(),
        })
    }
}

fn mismatch(name: &RefName, expected: Option<&RefTarget>, actual: Option<&RefTarget>) -> StoreError {
    let show = |t: Option<&RefTarget>| t.map_or_else(|| "<absent>".to_owned(), ToString::to_string);
    StoreError::RefConflict {
        ref_name: name.to_string(),
        message: format!("expected {}, found {}", show(expected), show(actual)),
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryRefs {
    refs: BTreeMap<RefName, RefTarget>,
    logs: HashMap<RefName, Vec<ReflogEntry>>,
}

/// A process-local ref store.
#[derive(Debug, Default)]
pub struct MemoryRefStore {
    inner: Mutex<MemoryRefs>,
}

impl MemoryRefStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefStore for MemoryRefStore {
    fn read(&self, name: &RefName) -> Result<Option<RefTarget>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.refs.get(name).cloned())
    }

    fn compare_and_set(
        &self,
        name: &RefName,
        expected: Option<&RefTarget>,
        new: &RefTarget,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let current = inner.refs.get(name);
        if current != expected {
            return Err(mismatch(name, expected, current));
        }
        inner.refs.insert(name.clone(), new.clone());
        Ok(())
    }

    fn compare_and_delete(&self, name: &RefName, expected: &RefTarget) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let current = inner.refs.get(name);
        if current != Some(expected) {
            return Err(mismatch(name, Some(expected), current));
        }
        inner.refs.remove(name);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(RefName, RefTarget)>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .refs
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(prefix))
            .map(|(name, target)| (name.clone(), target.clone()))
            .collect())
    }

    fn append_reflog(&self, name: &RefName, entry: &ReflogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.logs.entry(name.clone()).or_default().push(entry.clone());
        Ok(())
    }

    fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.logs.get(name).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Refs stored as loose files under the metadata directory.
///
/// `HEAD` lives at `<root>/HEAD`, branches at `<root>/refs/heads/<name>`.
/// A file holds either a hex object id or `ref: <name>`. Reflogs are JSON
/// lines under `<root>/logs/<name>`. Updates take `<ref>.lock`, re-read the
/// current value, and rename the lock over the ref.
#[derive(Debug, Clone)]
pub struct FsRefStore {
    root: PathBuf,
}

impl FsRefStore {
    #[must_use]
    pub fn new(meta_dir: &Path) -> Self {
        Self {
            root: meta_dir.to_path_buf(),
        }
    }

    fn ref_path(&self, name: &RefName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn log_path(&self, name: &RefName) -> PathBuf {
        self.root.join("logs").join(name.as_str())
    }

    fn read_path(&self, name: &RefName, path: &Path) -> Result<Option<RefTarget>, StoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let raw = raw.trim();
        let target = if let Some(symbolic) = raw.strip_prefix("ref: ") {
            RefTarget::Symbolic(RefName::new(symbolic.trim())?)
        } else {
            RefTarget::Direct(raw.parse().map_err(|e| {
                StoreError::corrupt(format!("ref {name}"), e)
            })?)
        };
        Ok(Some(target))
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut Vec<(RefName, RefTarget)>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name.ends_with(".lock") {
                continue;
            }
            let rel_name = format!("{rel}/{file_name}");
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &rel_name, out)?;
            } else if let Ok(name) = RefName::new(&rel_name) {
                if let Some(target) = self.read_path(&name, &entry.path())? {
                    out.push((name, target));
                }
            }
        }
        Ok(())
    }
}

fn encode_target(target: &RefTarget) -> Vec<u8> {
    format!("{target}\n").into_bytes()
}

impl RefStore for FsRefStore {
    fn read(&self, name: &RefName) -> Result<Option<RefTarget>, StoreError> {
        self.read_path(name, &self.ref_path(name))
    }

    fn compare_and_set(
        &self,
        name: &RefName,
        expected: Option<&RefTarget>,
        new: &RefTarget,
    ) -> Result<(), StoreError> {
        let path = self.ref_path(name);
        let lock = LockFile::acquire(&path).map_err(|e| match e {
            StoreError::Locked { path } => StoreError::RefConflict {
                ref_name: name.to_string(),
                message: format!("cannot lock ref: {} exists", path.display()),
            },
            other => other,
        })?;
        let current = self.read_path(name, &path)?;
        if current.as_ref() != expected {
            return Err(mismatch(name, expected, current.as_ref()));
        }
        lock.commit(&encode_target(new))?;
        debug!(%name, target = %new, "ref updated");
        Ok(())
    }

    fn compare_and_delete(&self, name: &RefName, expected: &RefTarget) -> Result<(), StoreError> {
        let path = self.ref_path(name);
        let lock = LockFile::acquire(&path)?;
        let current = self.read_path(name, &path)?;
        if current.as_ref() != Some(expected) {
            return Err(mismatch(name, Some(expected), current.as_ref()));
        }
        lock.commit_delete()?;
        debug!(%name, "ref deleted");
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(RefName, RefTarget)>, StoreError> {
        let mut out = Vec::new();
        for bare in ["HEAD", "ORIG_HEAD"] {
            if bare.starts_with(prefix) {
                let name = RefName::new(bare)?;
                if let Some(target) = self.read(&name)? {
                    out.push((name, target));
                }
            }
        }
        self.collect(&self.root.join("refs"), "refs", &mut out)?;
        out.retain(|(name, _)| name.as_str().starts_with(prefix));
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn append_reflog(&self, name: &RefName, entry: &ReflogEntry) -> Result<(), StoreError> {
        let path = self.log_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::corrupt("reflog entry", e))?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, StoreError> {
        let raw = match fs::read_to_string(self.log_path(name)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| StoreError::corrupt(format!("reflog {name}"), e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Signature, Timestamp};

    fn oid(seed: &[u8]) -> ObjectId {
        ObjectId::for_blob(seed)
    }

    fn exercise(store: &dyn RefStore) {
        let head = RefName::head();
        let main = RefName::branch("main").unwrap();

        store
            .compare_and_set(&head, None, &RefTarget::Symbolic(main.clone()))
            .unwrap();
        let unborn = store.resolve(&head).unwrap();
        assert_eq!(unborn.name, main);
        assert_eq!(unborn.target, None);

        store
            .compare_and_set(&main, None, &RefTarget::Direct(oid(b"1")))
            .unwrap();
        assert_eq!(store.resolve(&head).unwrap().target, Some(oid(b"1")));

        // Stale expectation is rejected and leaves the ref alone.
        let err = store
            .compare_and_set(&main, None, &RefTarget::Direct(oid(b"2")))
            .unwrap_err();
        assert!(matches!(err, StoreError::RefConflict { .. }));
        assert_eq!(store.read(&main).unwrap(), Some(RefTarget::Direct(oid(b"1"))));

        store
            .compare_and_set(
                &main,
                Some(&RefTarget::Direct(oid(b"1"))),
                &RefTarget::Direct(oid(b"2")),
            )
            .unwrap();

        let listed = store.list("refs/heads/").unwrap();
        assert_eq!(listed, vec![(main.clone(), RefTarget::Direct(oid(b"2")))]);

        let entry = ReflogEntry {
            old: Some(oid(b"1")),
            new: oid(b"2"),
            committer: Signature::new("t", "t@example.com", Timestamp::new(5, 0)),
            message: "commit: two".to_owned(),
        };
        store.append_reflog(&main, &entry).unwrap();
        store.append_reflog(&main, &entry).unwrap();
        assert_eq!(store.reflog(&main).unwrap().len(), 2);

        store
            .compare_and_delete(&main, &RefTarget::Direct(oid(b"2")))
            .unwrap();
        assert_eq!(store.read(&main).unwrap(), None);
    }

    #[test]
    fn memory_refs_contract() {
        exercise(&MemoryRefStore::new());
    }

    #[test]
    fn fs_refs_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsRefStore::new(dir.path()));
    }

    #[test]
    fn symref_cycle_is_detected() {
        let store = MemoryRefStore::new();
        let a = RefName::new("refs/heads/a").unwrap();
        let b = RefName::new("refs/heads/b").unwrap();
        store
            .compare_and_set(&a, None, &RefTarget::Symbolic(b.clone()))
            .unwrap();
        store
            .compare_and_set(&b, None, &RefTarget::Symbolic(a.clone()))
            .unwrap();
        assert!(matches!(
            store.resolve(&a).unwrap_err(),
            StoreError::SymrefLoop { .. }
        ));
    }

    #[test]
    fn fs_ref_held_lock_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRefStore::new(dir.path());
        let main = RefName::branch("main").unwrap();
        let _held = LockFile::acquire(&store.ref_path(&main)).unwrap();
        let err = store
            .compare_and_set(&main, None, &RefTarget::Direct(oid(b"x")))
            .unwrap_err();
        assert!(matches!(err, StoreError::RefConflict { .. }));
    }
}
