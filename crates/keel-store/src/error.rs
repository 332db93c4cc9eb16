//! Error types for store operations.
//!
//! [`StoreError`] is the single error type returned by the [`ObjectStore`],
//! [`RefStore`] and [`WorkTree`] traits. Callers match on variants (missing
//! object, CAS mismatch, held lock) instead of parsing messages.
//!
//! [`ObjectStore`]: crate::ObjectStore
//! [`RefStore`]: crate::RefStore
//! [`WorkTree`]: crate::WorkTree

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ObjectId, ObjectKind, OidParseError, RefNameError, TreeError};

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An object id did not resolve in the object store.
    #[error("object {oid} not found")]
    ObjectNotFound { oid: ObjectId },

    /// A ref, path or other named thing was not found.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// An object exists but has a different kind than the caller needed.
    #[error("object {oid} is a {actual}, expected a {expected}")]
    WrongKind {
        oid: ObjectId,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    /// A ref update failed because the ref's current value did not match the
    /// expected old value (compare-and-swap failure).
    #[error("ref conflict on `{ref_name}`: {message}")]
    RefConflict {
        /// The ref that could not be updated.
        ref_name: String,
        /// Details about the mismatch.
        message: String,
    },

    /// A lock file is already held by someone else (or left behind by a crash).
    #[error("unable to lock {}: lock file already exists", path.display())]
    Locked {
        /// The lock file path (`<target>.lock`).
        path: PathBuf,
    },

    #[error(transparent)]
    InvalidOid(#[from] OidParseError),

    #[error(transparent)]
    InvalidRefName(#[from] RefNameError),

    #[error("invalid tree: {0}")]
    InvalidTree(#[from] TreeError),

    /// A working-tree path escaped the root or named the metadata directory.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Symbolic refs nested too deeply, or formed a cycle.
    #[error("symbolic ref chain starting at `{start}` is too deep or cyclic")]
    SymrefLoop { start: String },

    /// Stored data could not be decoded.
    #[error("corrupt {what}: {message}")]
    Corrupt { what: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corrupt(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Corrupt {
            what: what.into(),
            message: message.to_string(),
        }
    }
}
