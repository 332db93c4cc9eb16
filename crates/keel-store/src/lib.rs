//! Storage layer for keel.
//!
//! This crate defines the three service traits every other keel crate talks
//! to, plus a memory and a filesystem backend for each:
//!
//! - [`ObjectStore`]: immutable, content-addressed objects (blobs, trees,
//!   commits, tags) keyed by [`ObjectId`].
//! - [`RefStore`]: mutable names with compare-and-set updates and reflogs.
//! - [`WorkTree`]: the user-visible files of a non-bare repository.
//!
//! # Crate layout
//!
//! - [`types`]: value types shared by the traits.
//! - [`codec`]: the canonical `<kind> <len>\0<payload>` object encoding.
//! - [`lockfile`]: `<target>.lock` exclusive-create locks.
//! - [`error`]: the [`StoreError`] enum returned by all trait methods.

pub mod codec;
pub mod error;
pub mod lockfile;
pub mod odb;
pub mod refs;
pub mod types;
pub mod worktree;

pub use error::StoreError;
pub use lockfile::LockFile;
pub use odb::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use refs::{FsRefStore, MemoryRefStore, RefStore, ResolvedRef};
pub use types::{
    Commit, EntryMode, FileStat, Object, ObjectId, ObjectKind, OidParseError, RefName,
    RefNameError, RefTarget, ReflogEntry, Signature, Tag, Timestamp, Tree, TreeEntry, TreeError,
};
pub use worktree::{FsWorkTree, MemoryWorkTree, WorkTree};
