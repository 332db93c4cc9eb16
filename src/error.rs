//! Error types for keel operations.
//!
//! [`KeelError`] is returned by every public operation. Each variant names a
//! failure a caller can act on (resolve conflicts, commit or stash local
//! changes, retry after a lock clears) without parsing the message.

use std::path::PathBuf;

use keel_store::{ObjectId, StoreError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::state::OperationKind;

/// Result alias used throughout the crate.
pub type KeelResult<T> = Result<T, KeelError>;

/// Unified error type for repository operations.
#[derive(Debug, Error)]
pub enum KeelError {
    /// An object id did not resolve in the object store.
    #[error("object {oid} not found")]
    ObjectNotFound { oid: ObjectId },

    /// A revision string matched more than one object.
    #[error("ambiguous revision `{spec}`: candidates are {}", candidates.join(", "))]
    AmbiguousRevision {
        spec: String,
        candidates: Vec<String>,
    },

    /// A revision string could not be resolved to a commit.
    #[error("invalid revision `{spec}`: {reason}")]
    InvalidRevision { spec: String, reason: String },

    /// The index holds conflicted entries; resolve them first.
    #[error("unmerged paths: {}; resolve them and stage the result first", paths.join(", "))]
    UnmergedPathsConflict { paths: Vec<String> },

    /// Local changes would be overwritten. Nothing was modified.
    #[error("local changes to {} would be overwritten; commit them or force the operation", paths.join(", "))]
    CheckoutConflict { paths: Vec<String> },

    /// A lock file is held, or a ref moved underneath us.
    #[error("lock contention on {resource}: {message}")]
    LockContention { resource: String, message: String },

    /// The operation needs a working tree and the repository has none.
    #[error("`{operation}` requires a working tree, but this repository is bare")]
    InvalidOperationOnBareRepository { operation: &'static str },

    /// The commit would record no change relative to its parent.
    #[error("nothing to commit: the tree matches the parent commit")]
    EmptyCommitRejected,

    /// A merge, cherry-pick or revert is waiting to be concluded.
    #[error("a {kind} is in progress; commit the resolution or abort it first")]
    OperationInProgress { kind: OperationKind },

    #[error("no merge, cherry-pick or revert is in progress")]
    NoOperationInProgress,

    /// Glob pathspecs that matched nothing.
    #[error("pathspec did not match any file: {}", patterns.join(", "))]
    UnmatchedPathspec { patterns: Vec<String> },

    #[error("invalid pathspec `{pattern}`: {reason}")]
    InvalidPathspec { pattern: String, reason: String },

    /// Only fast-forward was allowed and the histories have diverged.
    #[error("cannot fast-forward: HEAD and `{revision}` have diverged")]
    FastForwardImpossible { revision: String },

    /// A working-tree update stopped part-way. The index reflects exactly
    /// the paths in `applied`.
    #[error("cancelled after updating {} of {} path(s)", applied.len(), applied.len() + remaining.len())]
    Cancelled {
        applied: Vec<String>,
        remaining: Vec<String>,
    },

    /// A commit needs an author or committer and none is configured.
    #[error("no identity configured: set [user] name and email in config.toml")]
    MissingIdentity,

    #[error("not a keel repository: {}", path.display())]
    NotARepository { path: PathBuf },

    #[error("a repository already exists at {}", path.display())]
    AlreadyInitialized { path: PathBuf },

    #[error("ref `{name}` already exists")]
    RefExists { name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The persisted operation state could not be read or written.
    #[error("operation state error: {message}")]
    State { message: String },

    /// Raised by an armed failpoint (only with the `failpoints` feature).
    #[error("failpoint {name}: {message}")]
    Failpoint { name: String, message: String },

    #[error(transparent)]
    Store(StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for KeelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectNotFound { oid } => Self::ObjectNotFound { oid },
            StoreError::RefConflict { ref_name, message } => Self::LockContention {
                resource: ref_name,
                message,
            },
            StoreError::Locked { path } => Self::LockContention {
                resource: path.display().to_string(),
                message: "lock file exists; another operation may be running, or a previous one crashed".to_owned(),
            },
            StoreError::Io(e) => Self::Io(e),
            other => Self::Store(other),
        }
    }
}

impl From<keel_store::RefNameError> for KeelError {
    fn from(err: keel_store::RefNameError) -> Self {
        Self::Store(StoreError::InvalidRefName(err))
    }
}
