//! Flat trees: a recursive tree viewed as `path -> (mode, blob)`.
//!
//! Merging, checkout planning and index bookkeeping all reason per path, so
//! trees are flattened on the way in and rebuilt bottom-up on the way out.

use std::collections::BTreeMap;

use keel_store::{EntryMode, ObjectId, ObjectStore, StoreError, Tree, TreeEntry};
use serde::{Deserialize, Serialize};

/// One non-directory entry of a flattened tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlatEntry {
    pub mode: EntryMode,
    pub oid: ObjectId,
}

impl FlatEntry {
    #[must_use]
    pub const fn new(mode: EntryMode, oid: ObjectId) -> Self {
        Self { mode, oid }
    }
}

/// Repository-relative `/`-separated path to file entry, sorted by path.
pub type FlatTree = BTreeMap<String, FlatEntry>;

/// Flatten the tree `tree_oid` into a [`FlatTree`].
///
/// # Errors
/// Returns a [`StoreError`] if a tree object is missing or not a tree.
pub fn flatten_tree(store: &dyn ObjectStore, tree_oid: ObjectId) -> Result<FlatTree, StoreError> {
    let mut flat = FlatTree::new();
    walk(store, tree_oid, "", &mut flat)?;
    Ok(flat)
}

/// Flatten the root tree of `commit_oid`.
///
/// # Errors
/// Returns a [`StoreError`] if the commit or any tree is missing.
pub fn flatten_commit(
    store: &dyn ObjectStore,
    commit_oid: ObjectId,
) -> Result<FlatTree, StoreError> {
    let commit = store.read_commit(commit_oid)?;
    flatten_tree(store, commit.tree)
}

fn walk(
    store: &dyn ObjectStore,
    tree_oid: ObjectId,
    prefix: &str,
    flat: &mut FlatTree,
) -> Result<(), StoreError> {
    let tree = store.read_tree(tree_oid)?;
    for entry in tree.entries() {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{prefix}/{}", entry.name)
        };
        if entry.mode == EntryMode::Tree {
            walk(store, entry.oid, &path, flat)?;
        } else {
            flat.insert(path, FlatEntry::new(entry.mode, entry.oid));
        }
    }
    Ok(())
}

/// Write the tree hierarchy for `flat` bottom-up and return the root id.
///
/// Unchanged subtrees hash to ids that already exist, so the store writes
/// nothing new for them.
///
/// # Errors
/// Returns [`StoreError::InvalidTree`] if a path is both a file and a
/// directory, or any store error from writing.
pub fn build_tree(store: &dyn ObjectStore, flat: &FlatTree) -> Result<ObjectId, StoreError> {
    // directory path ("" for root) -> entries directly inside it
    let mut dirs: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
    dirs.entry(String::new()).or_default();

    for (path, entry) in flat {
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
        dirs.entry(parent.to_owned())
            .or_default()
            .push(TreeEntry::new(name, entry.mode, entry.oid));
        let mut dir = parent;
        while !dir.is_empty() {
            let up = dir.rsplit_once('/').map_or("", |(up, _)| up);
            dirs.entry(up.to_owned()).or_default();
            dir = up;
        }
    }

    // Deepest directories first so children are written before parents.
    let mut order: Vec<String> = dirs.keys().cloned().collect();
    order.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

    let mut root = None;
    for dir in order {
        let entries = dirs.remove(&dir).unwrap_or_default();
        let oid = store.write_tree(Tree::new(entries)?)?;
        if dir.is_empty() {
            root = Some(oid);
        } else {
            let (parent, name) = dir.rsplit_once('/').unwrap_or(("", dir.as_str()));
            dirs.entry(parent.to_owned())
                .or_default()
                .push(TreeEntry::new(name, EntryMode::Tree, oid));
        }
    }
    match root {
        Some(oid) => Ok(oid),
        None => store.write_tree(Tree::empty()),
    }
}

fn depth(dir: &str) -> usize {
    if dir.is_empty() {
        0
    } else {
        dir.matches('/').count() + 1
    }
}
