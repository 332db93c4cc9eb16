//! The [`ObjectStore`] trait and its backends.
//!
//! Objects are immutable and content-addressed: writing the same content
//! twice yields the same id and stores one copy. The trait is object-safe so
//! callers hold `&dyn ObjectStore` or `Box<dyn ObjectStore>`.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::trace;

use crate::codec;
use crate::error::StoreError;
use crate::types::{Commit, Object, ObjectId, ObjectKind, Tag, Tree};

/// Content-addressed object storage.
pub trait ObjectStore {
    /// Read an object, returning `None` if it is absent.
    fn read(&self, oid: ObjectId) -> Result<Option<Object>, StoreError>;

    /// Write an object and return its id. Idempotent.
    fn write(&self, object: &Object) -> Result<ObjectId, StoreError>;

    /// Whether the object exists.
    fn contains(&self, oid: ObjectId) -> Result<bool, StoreError>;

    /// All stored ids whose hex form starts with `prefix` (lowercase).
    fn ids_with_prefix(&self, prefix: &str) -> Result<Vec<ObjectId>, StoreError>;

    /// Read an object that must exist.
    fn read_existing(&self, oid: ObjectId) -> Result<Object, StoreError> {
        self.read(oid)?.ok_or(StoreError::ObjectNotFound { oid })
    }

    fn read_blob(&self, oid: ObjectId) -> Result<Vec<u8>, StoreError> {
        match self.read_existing(oid)? {
            Object::Blob(bytes) => Ok(bytes),
            other => Err(wrong_kind(oid, ObjectKind::Blob, &other)),
        }
    }

    fn read_tree(&self, oid: ObjectId) -> Result<Tree, StoreError> {
        match self.read_existing(oid)? {
            Object::Tree(tree) => Ok(tree),
            other => Err(wrong_kind(oid, ObjectKind::Tree, &other)),
        }
    }

    fn read_commit(&self, oid: ObjectId) -> Result<Commit, StoreError> {
        match self.read_existing(oid)? {
            Object::Commit(commit) => Ok(commit),
            other => Err(wrong_kind(oid, ObjectKind::Commit, &other)),
        }
    }

    fn read_tag(&self, oid: ObjectId) -> Result<Tag, StoreError> {
        match self.read_existing(oid)? {
            Object::Tag(tag) => Ok(tag),
            other => Err(wrong_kind(oid, ObjectKind::Tag, &other)),
        }
    }

    fn write_blob(&self, content: &[u8]) -> Result<ObjectId, StoreError> {
        self.write(&Object::Blob(content.to_vec()))
    }

    fn write_tree(&self, tree: Tree) -> Result<ObjectId, StoreError> {
        self.write(&Object::Tree(tree))
    }

    fn write_commit(&self, commit: Commit) -> Result<ObjectId, StoreError> {
        self.write(&Object::Commit(commit))
    }
}

fn wrong_kind(oid: ObjectId, expected: ObjectKind, actual: &Object) -> StoreError {
    StoreError::WrongKind {
        oid,
        expected,
        actual: actual.kind(),
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// A process-local object store, used by tests and ephemeral repositories.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, Object>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn read(&self, oid: ObjectId) -> Result<Option<Object>, StoreError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.get(&oid).cloned())
    }

    fn write(&self, object: &Object) -> Result<ObjectId, StoreError> {
        let oid = codec::object_id(object)?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.entry(oid).or_insert_with(|| object.clone());
        Ok(oid)
    }

    fn contains(&self, oid: ObjectId) -> Result<bool, StoreError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.contains_key(&oid))
    }

    fn ids_with_prefix(&self, prefix: &str) -> Result<Vec<ObjectId>, StoreError> {
        let prefix = prefix.to_ascii_lowercase();
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<ObjectId> = objects
            .keys()
            .filter(|oid| oid.to_string().starts_with(&prefix))
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Objects stored one file per object under `<root>/<2 hex>/<62 hex>`.
///
/// Writes go to a temp file in the fan-out directory and are renamed into
/// place, so a reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (or lazily create) a store rooted at `objects_dir`.
    #[must_use]
    pub fn new(objects_dir: &Path) -> Self {
        Self {
            root: objects_dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, oid: ObjectId) -> PathBuf {
        let hex = oid.to_string();
        let (prefix, rest) = hex.split_at(2);
        self.root.join(prefix).join(rest)
    }
}

impl ObjectStore for FsObjectStore {
    fn read(&self, oid: ObjectId) -> Result<Option<Object>, StoreError> {
        let bytes = match fs::read(self.object_path(oid)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if ObjectId::hash_encoded(&bytes) != oid {
            return Err(StoreError::corrupt(
                format!("object {oid}"),
                "content does not hash to its id",
            ));
        }
        codec::decode(&bytes).map(Some)
    }

    fn write(&self, object: &Object) -> Result<ObjectId, StoreError> {
        let (oid, bytes) = codec::encode_with_id(object)?;
        let path = self.object_path(oid);
        if path.exists() {
            return Ok(oid);
        }
        let Some(parent) = path.parent() else {
            return Err(StoreError::corrupt("object path", path.display()));
        };
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        trace!(%oid, kind = %object.kind(), size = bytes.len(), "object written");
        Ok(oid)
    }

    fn contains(&self, oid: ObjectId) -> Result<bool, StoreError> {
        Ok(self.object_path(oid).is_file())
    }

    fn ids_with_prefix(&self, prefix: &str) -> Result<Vec<ObjectId>, StoreError> {
        let prefix = prefix.to_ascii_lowercase();
        let fanouts: Vec<String> = if prefix.len() >= 2 {
            vec![prefix[..2].to_owned()]
        } else {
            match fs::read_dir(&self.root) {
                Ok(entries) => entries
                    .filter_map(Result::ok)
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|name| name.len() == 2 && name.starts_with(&prefix))
                    .collect(),
                Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            }
        };

        let mut ids = Vec::new();
        for fanout in fanouts {
            let entries = match fs::read_dir(self.root.join(&fanout)) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let Ok(name) = entry?.file_name().into_string() else {
                    continue;
                };
                let hex = format!("{fanout}{name}");
                if !hex.starts_with(&prefix) {
                    continue;
                }
                if let Ok(oid) = hex.parse() {
                    ids.push(oid);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryMode, TreeEntry};

    fn exercise(store: &dyn ObjectStore) {
        let blob = store.write_blob(b"hello world").unwrap();
        assert_eq!(blob, ObjectId::for_blob(b"hello world"));
        assert_eq!(store.write_blob(b"hello world").unwrap(), blob);
        assert!(store.contains(blob).unwrap());
        assert_eq!(store.read_blob(blob).unwrap(), b"hello world");

        let tree = Tree::new(vec![TreeEntry::new("hello.txt", EntryMode::Blob, blob)]).unwrap();
        let tree_id = store.write_tree(tree.clone()).unwrap();
        assert_eq!(store.read_tree(tree_id).unwrap(), tree);

        let err = store.read_tree(blob).unwrap_err();
        assert!(matches!(err, StoreError::WrongKind { .. }));

        let missing = ObjectId::for_blob(b"never written");
        assert!(store.read(missing).unwrap().is_none());
        assert!(matches!(
            store.read_blob(missing).unwrap_err(),
            StoreError::ObjectNotFound { .. }
        ));

        let hex = blob.to_string();
        assert_eq!(store.ids_with_prefix(&hex[..6]).unwrap(), vec![blob]);
        assert_eq!(store.ids_with_prefix(&hex).unwrap(), vec![blob]);
        assert_eq!(store.ids_with_prefix("").unwrap().len(), 2);
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryObjectStore::new());
    }

    #[test]
    fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsObjectStore::new(&dir.path().join("objects")));
    }

    #[test]
    fn fs_store_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let oid = store.write_blob(b"original").unwrap();
        fs::write(store.object_path(oid), b"blob 3\0bad").unwrap();
        assert!(matches!(
            store.read(oid).unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }
}
