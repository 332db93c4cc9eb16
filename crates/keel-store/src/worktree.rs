//! The [`WorkTree`] trait and its backends.
//!
//! Paths are repository-relative, `/`-separated, and never name the metadata
//! directory. Directories are implicit: writing `a/b/c` creates `a/b`, and
//! removing the last file in a directory prunes it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::UNIX_EPOCH;

use crate::error::StoreError;
use crate::types::{EntryMode, FileStat};

/// The user-visible files of a non-bare repository.
pub trait WorkTree {
    /// Stat a file without reading it. Returns `None` for missing paths and
    /// for directories.
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StoreError>;

    /// Read a file's content (a symlink's target for links).
    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Create or replace a file with the given mode, creating parent
    /// directories as needed.
    fn write(&self, path: &str, content: &[u8], mode: EntryMode) -> Result<(), StoreError>;

    /// Remove a file if present and prune directories left empty.
    fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Every file path, sorted.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Reject paths that are absolute, contain `.`/`..`/empty components, or
/// point into the metadata directory.
///
/// # Errors
/// Returns [`StoreError::InvalidPath`] describing the first problem found.
pub fn validate_path(path: &str, reserved: &str) -> Result<(), StoreError> {
    let fail = |reason: &str| {
        Err(StoreError::InvalidPath {
            path: path.to_owned(),
            reason: reason.to_owned(),
        })
    };
    if path.is_empty() {
        return fail("path is empty");
    }
    if path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return fail("path must be relative and '/'-separated");
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return fail("path has an empty, '.' or '..' component");
        }
    }
    if path.split('/').next() == Some(reserved) {
        return fail("path is inside the metadata directory");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// A working tree rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct FsWorkTree {
    root: PathBuf,
    meta_dir_name: String,
}

impl FsWorkTree {
    /// A working tree at `root`, skipping the metadata directory
    /// `meta_dir_name` (for example `.keel`).
    #[must_use]
    pub fn new(root: &Path, meta_dir_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            meta_dir_name: meta_dir_name.to_owned(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, path: &str) -> Result<PathBuf, StoreError> {
        validate_path(path, &self.meta_dir_name)?;
        Ok(self.root.join(path))
    }

    fn prune_empty_parents(&self, abs: &Path) {
        let mut dir = abs.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // Fails (and stops) as soon as a directory still has entries.
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    fn walk(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if rel.is_empty() && name == self.meta_dir_name {
                continue;
            }
            let rel_path = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(&entry.path(), &rel_path, out)?;
            } else {
                out.push(rel_path);
            }
        }
        Ok(())
    }
}

fn mode_of(meta: &fs::Metadata) -> EntryMode {
    if meta.file_type().is_symlink() {
        return EntryMode::Link;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 != 0 {
            return EntryMode::BlobExecutable;
        }
    }
    EntryMode::Blob
}

fn remove_existing(abs: &Path) -> Result<(), StoreError> {
    match fs::symlink_metadata(abs) {
        Ok(meta) if meta.is_dir() => {
            // Only an empty directory may be replaced by a file.
            fs::remove_dir(abs)?;
        }
        Ok(_) => fs::remove_file(abs)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

impl WorkTree for FsWorkTree {
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StoreError> {
        let meta = match fs::symlink_metadata(self.abs(path)?) {
            Ok(meta) => meta,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Ok(None);
        }
        let (mtime_secs, mtime_nanos) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or((0, 0), |d| {
                (i64::try_from(d.as_secs()).unwrap_or(i64::MAX), d.subsec_nanos())
            });
        Ok(Some(FileStat {
            size: meta.len(),
            mtime_secs,
            mtime_nanos,
            mode: mode_of(&meta),
        }))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let abs = self.abs(path)?;
        let meta = fs::symlink_metadata(&abs).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                message: format!("working tree file `{path}`"),
            },
            _ => e.into(),
        })?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&abs)?;
            return Ok(target.to_string_lossy().into_owned().into_bytes());
        }
        Ok(fs::read(&abs)?)
    }

    fn write(&self, path: &str, content: &[u8], mode: EntryMode) -> Result<(), StoreError> {
        let abs = self.abs(path)?;
        let Some(parent) = abs.parent() else {
            return Err(StoreError::InvalidPath {
                path: path.to_owned(),
                reason: "path has no parent directory".to_owned(),
            });
        };
        fs::create_dir_all(parent)?;

        match mode {
            EntryMode::Tree => Err(StoreError::InvalidPath {
                path: path.to_owned(),
                reason: "cannot write a directory entry as a file".to_owned(),
            }),
            #[cfg(unix)]
            EntryMode::Link => {
                remove_existing(&abs)?;
                let target = String::from_utf8_lossy(content).into_owned();
                std::os::unix::fs::symlink(target, &abs)?;
                Ok(())
            }
            _ => {
                let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                tmp.write_all(content)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let bits = if mode == EntryMode::BlobExecutable { 0o755 } else { 0o644 };
                    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(bits))?;
                }
                if fs::symlink_metadata(&abs).is_ok_and(|m| m.is_dir() || m.file_type().is_symlink()) {
                    remove_existing(&abs)?;
                }
                tmp.persist(&abs).map_err(|e| StoreError::Io(e.error))?;
                Ok(())
            }
        }
    }

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        let abs = self.abs(path)?;
        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => fs::remove_file(&abs)?,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.prune_empty_parents(&abs);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        self.walk(&self.root, "", &mut out)?;
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryFiles {
    files: BTreeMap<String, (Vec<u8>, EntryMode, u64)>,
    clock: u64,
}

/// A working tree held in memory. Every write bumps a logical clock that
/// stands in for the modification time.
#[derive(Debug, Default)]
pub struct MemoryWorkTree {
    inner: Mutex<MemoryFiles>,
}

impl MemoryWorkTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkTree for MemoryWorkTree {
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.files.get(path).map(|(content, mode, tick)| FileStat {
            size: content.len() as u64,
            mtime_secs: i64::try_from(*tick).unwrap_or(i64::MAX),
            mtime_nanos: 0,
            mode: *mode,
        }))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .files
            .get(path)
            .map(|(content, _, _)| content.clone())
            .ok_or_else(|| StoreError::NotFound {
                message: format!("working tree file `{path}`"),
            })
    }

    fn write(&self, path: &str, content: &[u8], mode: EntryMode) -> Result<(), StoreError> {
        validate_path(path, "")?;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // A file may not shadow a directory, nor sit beneath another file.
        let dir_prefix = format!("{path}/");
        if inner.files.keys().any(|k| k.starts_with(&dir_prefix)) {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::DirectoryNotEmpty,
                format!("`{path}` is a non-empty directory"),
            )));
        }
        let mut ancestor = path;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if inner.files.contains_key(parent) {
                return Err(StoreError::Io(std::io::Error::new(
                    ErrorKind::NotADirectory,
                    format!("`{parent}` is a file"),
                )));
            }
            ancestor = parent;
        }
        inner.clock += 1;
        let tick = inner.clock;
        inner
            .files
            .insert(path.to_owned(), (content.to_vec(), mode, tick));
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.files.remove(path);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.files.keys().cloned().collect())
    }
}
