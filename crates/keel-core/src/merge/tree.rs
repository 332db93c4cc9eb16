//! Three-way tree merge over flattened trees.
//!
//! Every path in the union of ancestor, ours and theirs is decided on its
//! own: unchanged-on-one-side paths take the other side, identical changes
//! are taken once, and divergent changes to text files go through
//! [`merge_text`]. Whatever cannot be decided is reported as a
//! [`PathConflict`]; the engine never touches a working tree or index.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use keel_store::{EntryMode, ObjectId, ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::text::{MarkerStyle, TextMerge, is_binary, merge_text};
use crate::flat::{FlatEntry, FlatTree};

/// Which side of a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Ours,
    Theirs,
}

/// Why a path could not be merged automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Overlapping edits to the same lines.
    Content,
    /// One side deleted the file, the other modified it.
    ModifyDelete { deleted_by: Side },
    /// Both sides added the path with different content.
    AddAdd,
    /// Modes or entry kinds (file, executable, symlink) diverged.
    Mode,
    /// Both sides changed a binary file.
    Binary,
    /// One side has a file where the merged tree has a directory.
    DirectoryFile,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => write!(f, "content conflict"),
            Self::ModifyDelete {
                deleted_by: Side::Ours,
            } => write!(f, "deleted by us, modified by them"),
            Self::ModifyDelete {
                deleted_by: Side::Theirs,
            } => write!(f, "modified by us, deleted by them"),
            Self::AddAdd => write!(f, "added by both with different content"),
            Self::Mode => write!(f, "divergent mode change"),
            Self::Binary => write!(f, "binary file changed on both sides"),
            Self::DirectoryFile => write!(f, "file/directory conflict"),
        }
    }
}

/// One unresolved path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathConflict {
    pub path: String,
    pub reason: ConflictReason,
    pub ancestor: Option<FlatEntry>,
    pub ours: Option<FlatEntry>,
    pub theirs: Option<FlatEntry>,
    /// Blob holding the merged content with conflict markers, when a text
    /// merge was attempted.
    pub marked: Option<ObjectId>,
}

impl PathConflict {
    /// What the working tree should show at this path while the conflict is
    /// unresolved: the marked-up merge if there is one, otherwise whichever
    /// side still has the file.
    #[must_use]
    pub fn worktree_entry(&self) -> Option<FlatEntry> {
        if self.reason == ConflictReason::DirectoryFile {
            return None;
        }
        if let Some(marked) = self.marked {
            let mode = self
                .ours
                .or(self.theirs)
                .map_or(EntryMode::Blob, |e| e.mode);
            return Some(FlatEntry::new(mode, marked));
        }
        self.ours.or(self.theirs)
    }
}

/// Options for [`merge_trees`].
#[derive(Clone, Debug, Default)]
pub struct TreeMergeOptions {
    pub markers: MarkerStyle,
    /// Resolve every conflict in place (marked content, else ours) so the
    /// result is a complete tree. Used to build virtual merge bases.
    pub virtual_ancestor: bool,
}

/// Result of [`merge_trees`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeMergeOutcome {
    /// Every cleanly merged path. In virtual-ancestor mode this also holds
    /// the fallback content of conflicted paths.
    pub merged: FlatTree,
    /// Conflicted paths, sorted by path.
    pub conflicts: Vec<PathConflict>,
}

impl TreeMergeOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Merge `ours` and `theirs` against `ancestor`.
///
/// Merged blobs and conflict-marked blobs are written to `store`.
///
/// # Errors
/// Returns a [`StoreError`] if a blob cannot be read or written.
#[instrument(skip_all, fields(ancestor = ancestor.len(), ours = ours.len(), theirs = theirs.len()))]
pub fn merge_trees(
    store: &dyn ObjectStore,
    ancestor: &FlatTree,
    ours: &FlatTree,
    theirs: &FlatTree,
    options: &TreeMergeOptions,
) -> Result<TreeMergeOutcome, StoreError> {
    let paths: BTreeSet<&String> = ancestor.keys().chain(ours.keys()).chain(theirs.keys()).collect();

    let mut outcome = TreeMergeOutcome::default();
    for path in paths {
        let a = ancestor.get(path).copied();
        let o = ours.get(path).copied();
        let t = theirs.get(path).copied();
        match merge_path(store, a, o, t, &options.markers)? {
            PathMerge::Take(Some(entry)) => {
                outcome.merged.insert(path.clone(), entry);
            }
            PathMerge::Take(None) => {}
            PathMerge::Conflict { reason, marked } => {
                debug!(%path, %reason, "path conflict");
                outcome.conflicts.push(PathConflict {
                    path: path.clone(),
                    reason,
                    ancestor: a,
                    ours: o,
                    theirs: t,
                    marked,
                });
            }
        }
    }

    detect_directory_file(ancestor, ours, theirs, &mut outcome);

    if options.virtual_ancestor {
        for conflict in &outcome.conflicts {
            if let Some(entry) = conflict.worktree_entry() {
                outcome.merged.insert(conflict.path.clone(), entry);
            }
        }
    }

    debug!(
        merged = outcome.merged.len(),
        conflicts = outcome.conflicts.len(),
        "tree merge finished"
    );
    Ok(outcome)
}

enum PathMerge {
    /// `None` means the path is absent from the result.
    Take(Option<FlatEntry>),
    Conflict {
        reason: ConflictReason,
        marked: Option<ObjectId>,
    },
}

const fn conflict(reason: ConflictReason) -> PathMerge {
    PathMerge::Conflict {
        reason,
        marked: None,
    }
}

fn merge_path(
    store: &dyn ObjectStore,
    a: Option<FlatEntry>,
    o: Option<FlatEntry>,
    t: Option<FlatEntry>,
    markers: &MarkerStyle,
) -> Result<PathMerge, StoreError> {
    if o == t {
        return Ok(PathMerge::Take(o));
    }
    if o == a {
        return Ok(PathMerge::Take(t));
    }
    if t == a {
        return Ok(PathMerge::Take(o));
    }

    // Both sides changed the path, differently.
    match (a, o, t) {
        (Some(_), None, Some(_)) => Ok(conflict(ConflictReason::ModifyDelete {
            deleted_by: Side::Ours,
        })),
        (Some(_), Some(_), None) => Ok(conflict(ConflictReason::ModifyDelete {
            deleted_by: Side::Theirs,
        })),
        (None, Some(o), Some(t)) => merge_added(store, o, t, markers),
        (Some(a), Some(o), Some(t)) => merge_modified(store, a, o, t, markers),
        // o == t covers both-absent, and a missing ancestor with one side
        // absent is covered by o == a or t == a.
        _ => Ok(PathMerge::Take(o)),
    }
}

fn merge_added(
    store: &dyn ObjectStore,
    o: FlatEntry,
    t: FlatEntry,
    markers: &MarkerStyle,
) -> Result<PathMerge, StoreError> {
    if o.mode != t.mode || !o.mode.is_file() {
        return Ok(conflict(ConflictReason::AddAdd));
    }
    let ours = store.read_blob(o.oid)?;
    let theirs = store.read_blob(t.oid)?;
    if is_binary(&ours) || is_binary(&theirs) {
        return Ok(conflict(ConflictReason::AddAdd));
    }
    text_conflict(store, b"", &ours, &theirs, markers, ConflictReason::AddAdd, o.mode)
}

fn merge_modified(
    store: &dyn ObjectStore,
    a: FlatEntry,
    o: FlatEntry,
    t: FlatEntry,
    markers: &MarkerStyle,
) -> Result<PathMerge, StoreError> {
    let involves_link = [a, o, t].iter().any(|e| e.mode == EntryMode::Link);
    if involves_link {
        // Symlink targets are never merged line by line.
        let reason = if o.mode == t.mode {
            ConflictReason::Content
        } else {
            ConflictReason::Mode
        };
        return Ok(conflict(reason));
    }

    let mode = if o.mode == t.mode {
        o.mode
    } else if o.mode == a.mode {
        t.mode
    } else if t.mode == a.mode {
        o.mode
    } else {
        return Ok(conflict(ConflictReason::Mode));
    };

    if o.oid == t.oid || t.oid == a.oid {
        return Ok(PathMerge::Take(Some(FlatEntry::new(mode, o.oid))));
    }
    if o.oid == a.oid {
        return Ok(PathMerge::Take(Some(FlatEntry::new(mode, t.oid))));
    }

    let base = store.read_blob(a.oid)?;
    let ours = store.read_blob(o.oid)?;
    let theirs = store.read_blob(t.oid)?;
    if is_binary(&base) || is_binary(&ours) || is_binary(&theirs) {
        return Ok(conflict(ConflictReason::Binary));
    }
    text_conflict(store, &base, &ours, &theirs, markers, ConflictReason::Content, mode)
}

fn text_conflict(
    store: &dyn ObjectStore,
    base: &[u8],
    ours: &[u8],
    theirs: &[u8],
    markers: &MarkerStyle,
    reason: ConflictReason,
    mode: EntryMode,
) -> Result<PathMerge, StoreError> {
    match merge_text(base, ours, theirs, markers) {
        TextMerge::Clean(content) => {
            let oid = store.write_blob(&content)?;
            Ok(PathMerge::Take(Some(FlatEntry::new(mode, oid))))
        }
        TextMerge::Conflicted { content, .. } => {
            let marked = store.write_blob(&content)?;
            Ok(PathMerge::Conflict {
                reason,
                marked: Some(marked),
            })
        }
    }
}

/// A merged file whose path is also a directory of another file in the
/// result cannot be represented; demote it to a conflict. Conflicted paths
/// that still leave a file in the working tree count as files.
fn detect_directory_file(
    ancestor: &FlatTree,
    ours: &FlatTree,
    theirs: &FlatTree,
    outcome: &mut TreeMergeOutcome,
) {
    let files = outcome.merged.keys().chain(
        outcome
            .conflicts
            .iter()
            .filter(|c| c.worktree_entry().is_some())
            .map(|c| &c.path),
    );
    let mut dirs: HashSet<String> = HashSet::new();
    for path in files {
        let mut rest = path.as_str();
        while let Some((parent, _)) = rest.rsplit_once('/') {
            if !dirs.insert(parent.to_owned()) {
                break;
            }
            rest = parent;
        }
    }

    let clashing: Vec<String> = outcome
        .merged
        .keys()
        .filter(|p| dirs.contains(p.as_str()))
        .cloned()
        .collect();
    let mut demoted: Vec<PathConflict> = Vec::new();
    for conflict in &mut outcome.conflicts {
        if dirs.contains(conflict.path.as_str()) {
            conflict.reason = ConflictReason::DirectoryFile;
        }
    }
    for path in clashing {
        debug!(%path, "file/directory conflict");
        demoted.push(PathConflict {
            reason: ConflictReason::DirectoryFile,
            ancestor: ancestor.get(&path).copied(),
            ours: ours.get(&path).copied(),
            theirs: theirs.get(&path).copied(),
            marked: None,
            path,
        });
    }
    for conflict in &demoted {
        outcome.merged.remove(&conflict.path);
    }
    if !demoted.is_empty() {
        outcome.conflicts.extend(demoted);
        outcome.conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    }
}
