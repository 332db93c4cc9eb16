//! Persisted state of an interrupted merge, cherry-pick or revert.
//!
//! When an operation stops on conflicts it writes `<meta>/operation.json`
//! describing what to do once the user has resolved them: the commit being
//! merged or replayed, the message to use, and (for cherry-picks) the
//! original author. A later commit reads and then deletes the file; abort
//! and hard reset delete it without committing.
//!
//! Writes are atomic (temp file, fsync, rename) so a crash leaves either the
//! old file or the new one.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use keel_store::{ObjectId, Signature};
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, KeelResult};

/// Which operation is waiting to be concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Merge,
    CherryPick,
    Revert,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::CherryPick => write!(f, "cherry-pick"),
            Self::Revert => write!(f, "revert"),
        }
    }
}

/// The on-disk record of an operation stopped on conflicts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationState {
    pub kind: OperationKind,
    /// HEAD's commit when the operation started (`None` if unborn).
    pub head_before: Option<ObjectId>,
    /// The commit being merged, picked or reverted.
    pub other: ObjectId,
    /// Message for the concluding commit.
    pub message: String,
    /// Author for the concluding commit; set for cherry-picks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Signature>,
    /// Paths that were conflicted when the operation stopped.
    pub conflicts: Vec<String>,
    /// Unix seconds when the operation started.
    pub started_at: u64,
}

impl OperationState {
    #[must_use]
    pub fn new(
        kind: OperationKind,
        head_before: Option<ObjectId>,
        other: ObjectId,
        message: String,
    ) -> Self {
        Self {
            kind,
            head_before,
            other,
            message,
            author: None,
            conflicts: Vec::new(),
            started_at: now_secs(),
        }
    }

    /// `<meta>/operation.json`.
    #[must_use]
    pub fn default_path(meta_dir: &Path) -> PathBuf {
        meta_dir.join("operation.json")
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if serialization fails.
    pub fn to_json(&self) -> KeelResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| KeelError::State {
            message: format!("serialize: {e}"),
        })
    }

    /// Parse from JSON.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if the JSON is malformed.
    pub fn from_json(json: &str) -> KeelResult<Self> {
        serde_json::from_str(json).map_err(|e| KeelError::State {
            message: format!("deserialize: {e}"),
        })
    }

    /// Write atomically to `path`.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] on any I/O failure.
    pub fn write_atomic(&self, path: &Path) -> KeelResult<()> {
        let json = self.to_json()?;
        let io_err = |what: &str, e: std::io::Error| KeelError::State {
            message: format!("{what} {}: {e}", path.display()),
        };
        let dir = path.parent().ok_or_else(|| KeelError::State {
            message: format!("no parent directory for {}", path.display()),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err("create temp for", e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| io_err("write", e))?;
        tmp.as_file().sync_all().map_err(|e| io_err("fsync", e))?;
        tmp.persist(path).map_err(|e| io_err("rename onto", e.error))?;
        Ok(())
    }

    /// Read `path`, returning `None` if no operation is recorded.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if the file exists but cannot be read or
    /// parsed.
    pub fn read(path: &Path) -> KeelResult<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeelError::State {
                message: format!("read {}: {e}", path.display()),
            }),
        }
    }

    /// Delete the record at `path`. Missing is fine.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if the file exists but cannot be removed.
    pub fn remove(path: &Path) -> KeelResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeelError::State {
                message: format!("remove {}: {e}", path.display()),
            }),
        }
    }
}

/// The repository's overall state, as reported by
/// [`Repository::state`](crate::Repository::state).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepoState {
    /// No operation pending and no conflicts in the index.
    Clean,
    /// The index has conflicts but no operation record explains them.
    Conflicted { paths: Vec<String> },
    /// An operation is waiting; `unresolved` lists paths still conflicted.
    InProgress {
        kind: OperationKind,
        unresolved: Vec<String>,
    },
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OperationState {
        let mut state = OperationState::new(
            OperationKind::CherryPick,
            Some(ObjectId::for_blob(b"head")),
            ObjectId::for_blob(b"picked"),
            "pick me\n".to_owned(),
        );
        state.author = Some(Signature::now("Orig", "orig@example.com"));
        state.conflicts = vec!["a.txt".to_owned()];
        state
    }

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = OperationState::default_path(dir.path());
        assert_eq!(OperationState::read(&path).unwrap(), None);

        let state = sample();
        state.write_atomic(&path).unwrap();
        assert_eq!(OperationState::read(&path).unwrap(), Some(state));

        OperationState::remove(&path).unwrap();
        OperationState::remove(&path).unwrap();
        assert_eq!(OperationState::read(&path).unwrap(), None);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"cherry_pick\""), "{json}");
        assert_eq!(OperationKind::CherryPick.to_string(), "cherry-pick");
    }

    #[test]
    fn malformed_file_is_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = OperationState::default_path(dir.path());
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            OperationState::read(&path).unwrap_err(),
            KeelError::State { .. }
        ));
    }
}
