//! The staging area.
//!
//! The index maps each tracked path to a [`Slot`]: either one resolved blob,
//! or up to three conflict stages left behind by a merge, cherry-pick or
//! revert. It is stored as `<meta>/index.json` and only ever written through
//! [`IndexGuard`](crate::lock::IndexGuard), which holds `index.json.lock`.
//!
//! Stat caches are advisory. They let checkout skip hashing files whose size
//! and mtime have not changed since the index last saw them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use keel_core::{FlatEntry, FlatTree, build_tree};
use keel_store::{EntryMode, FileStat, ObjectId, ObjectStore};
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, KeelResult};

/// Current on-disk format version.
pub const INDEX_VERSION: u32 = 1;

/// A file's size and mtime as last seen by the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCache {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl StatCache {
    #[must_use]
    pub const fn from_stat(stat: &FileStat) -> Self {
        Self {
            size: stat.size,
            mtime_secs: stat.mtime_secs,
            mtime_nanos: stat.mtime_nanos,
        }
    }

    /// `true` if `stat` looks unchanged and is old enough to trust.
    ///
    /// A file modified within the same second the cache was taken may change
    /// again without its mtime moving, so recent mtimes are never trusted.
    #[must_use]
    pub fn vouches_for(&self, stat: &FileStat) -> bool {
        self.size == stat.size
            && self.mtime_secs == stat.mtime_secs
            && self.mtime_nanos == stat.mtime_nanos
            && stat.mtime_secs < now_secs() - 1
    }
}

/// A blob staged at some stage of a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBlob {
    pub oid: ObjectId,
    pub mode: EntryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<StatCache>,
}

impl StagedBlob {
    #[must_use]
    pub const fn new(oid: ObjectId, mode: EntryMode) -> Self {
        Self {
            oid,
            mode,
            stat: None,
        }
    }

    #[must_use]
    pub const fn with_stat(mut self, stat: Option<StatCache>) -> Self {
        self.stat = stat;
        self
    }

    /// Mode and id, without the stat cache.
    #[must_use]
    pub const fn flat(&self) -> FlatEntry {
        FlatEntry::new(self.mode, self.oid)
    }
}

impl From<FlatEntry> for StagedBlob {
    fn from(entry: FlatEntry) -> Self {
        Self::new(entry.oid, entry.mode)
    }
}

/// Conflict stage numbers, as shown by `status` and the CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Resolved = 0,
    Ancestor = 1,
    Ours = 2,
    Theirs = 3,
}

impl Stage {
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Everything the index records for one path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Slot {
    Resolved(StagedBlob),
    /// At least one of the three stages is present.
    Conflicted {
        #[serde(default)]
        ancestor: Option<StagedBlob>,
        #[serde(default)]
        ours: Option<StagedBlob>,
        #[serde(default)]
        theirs: Option<StagedBlob>,
    },
}

impl Slot {
    #[must_use]
    pub const fn resolved(&self) -> Option<&StagedBlob> {
        match self {
            Self::Resolved(blob) => Some(blob),
            Self::Conflicted { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_conflicted(&self) -> bool {
        matches!(self, Self::Conflicted { .. })
    }

    /// The same slot with every stat cache dropped, for content comparison.
    #[must_use]
    pub const fn without_stat(&self) -> Self {
        const fn strip(blob: Option<StagedBlob>) -> Option<StagedBlob> {
            match blob {
                Some(b) => Some(b.with_stat(None)),
                None => None,
            }
        }
        match *self {
            Self::Resolved(blob) => Self::Resolved(blob.with_stat(None)),
            Self::Conflicted {
                ancestor,
                ours,
                theirs,
            } => Self::Conflicted {
                ancestor: strip(ancestor),
                ours: strip(ours),
                theirs: strip(theirs),
            },
        }
    }

    /// `true` if both slots stage the same content, ignoring stat caches.
    #[must_use]
    pub fn same_content(a: Option<&Self>, b: Option<&Self>) -> bool {
        a.map(Self::without_stat) == b.map(Self::without_stat)
    }

    /// The staged blobs with their stage numbers, lowest stage first.
    #[must_use]
    pub fn stages(&self) -> Vec<(Stage, StagedBlob)> {
        match self {
            Self::Resolved(blob) => vec![(Stage::Resolved, *blob)],
            Self::Conflicted {
                ancestor,
                ours,
                theirs,
            } => [
                (Stage::Ancestor, ancestor),
                (Stage::Ours, ours),
                (Stage::Theirs, theirs),
            ]
            .into_iter()
            .filter_map(|(stage, blob)| blob.map(|b| (stage, b)))
            .collect(),
        }
    }
}

/// One `(path, stage, blob)` row of the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry<'a> {
    pub path: &'a str,
    pub stage: Stage,
    pub blob: StagedBlob,
}

/// The staging area: path to [`Slot`], sorted by path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Index {
    version: u32,
    entries: BTreeMap<String, Slot>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Index {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An index with every path of `flat` resolved, no stat caches.
    #[must_use]
    pub fn from_flat(flat: &FlatTree) -> Self {
        let entries = flat
            .iter()
            .map(|(path, entry)| (path.clone(), Slot::Resolved(StagedBlob::from(*entry))))
            .collect();
        Self {
            version: INDEX_VERSION,
            entries,
        }
    }

    /// Load `path`; a missing file is an empty index.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> KeelResult<Self> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let index: Self = serde_json::from_slice(&data).map_err(|e| KeelError::State {
            message: format!("corrupt index {}: {e}", path.display()),
        })?;
        if index.version != INDEX_VERSION {
            return Err(KeelError::State {
                message: format!(
                    "index {} has version {}, expected {INDEX_VERSION}",
                    path.display(),
                    index.version
                ),
            });
        }
        Ok(index)
    }

    /// Serialize for writing through the index lock.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if serialization fails.
    pub fn to_bytes(&self) -> KeelResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|e| KeelError::State {
            message: format!("serialize index: {e}"),
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Slot> {
        self.entries.get(path)
    }

    /// The resolved blob at `path`, if the path is tracked and not conflicted.
    #[must_use]
    pub fn resolved(&self, path: &str) -> Option<&StagedBlob> {
        self.entries.get(path).and_then(Slot::resolved)
    }

    /// `true` if `path` has any stage.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn set_resolved(&mut self, path: &str, blob: StagedBlob) {
        self.entries.insert(path.to_owned(), Slot::Resolved(blob));
    }

    /// Record conflict stages for `path`. With all three absent the path is
    /// removed instead.
    pub fn set_conflicted(
        &mut self,
        path: &str,
        ancestor: Option<StagedBlob>,
        ours: Option<StagedBlob>,
        theirs: Option<StagedBlob>,
    ) {
        if ancestor.is_none() && ours.is_none() && theirs.is_none() {
            self.entries.remove(path);
            return;
        }
        self.entries.insert(
            path.to_owned(),
            Slot::Conflicted {
                ancestor,
                ours,
                theirs,
            },
        );
    }

    pub fn remove(&mut self, path: &str) -> Option<Slot> {
        self.entries.remove(path)
    }

    /// Update the stat cache of a resolved path. Conflicted or missing
    /// paths are left alone.
    pub fn refresh_stat(&mut self, path: &str, stat: Option<StatCache>) {
        if let Some(Slot::Resolved(blob)) = self.entries.get_mut(path) {
            blob.stat = stat;
        }
    }

    /// Paths with conflict stages, sorted.
    #[must_use]
    pub fn conflicts(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, slot)| slot.is_conflicted())
            .map(|(path, _)| path.clone())
            .collect()
    }

    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        self.entries.values().any(Slot::is_conflicted)
    }

    /// Every `(path, stage, blob)` row, sorted by path then stage.
    #[must_use]
    pub fn entries(&self) -> Vec<IndexEntry<'_>> {
        self.entries
            .iter()
            .flat_map(|(path, slot)| {
                slot.stages()
                    .into_iter()
                    .map(move |(stage, blob)| IndexEntry { path, stage, blob })
            })
            .collect()
    }

    /// Tracked paths, any stage, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `(path, slot)` pairs, sorted by path.
    pub fn slots(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.entries.iter().map(|(p, s)| (p.as_str(), s))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The resolved content as a flat tree.
    ///
    /// # Errors
    /// Returns [`KeelError::UnmergedPathsConflict`] listing every conflicted
    /// path.
    pub fn to_flat(&self) -> KeelResult<FlatTree> {
        let conflicts = self.conflicts();
        if !conflicts.is_empty() {
            return Err(KeelError::UnmergedPathsConflict { paths: conflicts });
        }
        Ok(self
            .entries
            .iter()
            .filter_map(|(path, slot)| slot.resolved().map(|b| (path.clone(), b.flat())))
            .collect())
    }

    /// Resolved entries as a flat tree, skipping conflicted paths.
    #[must_use]
    pub fn resolved_flat(&self) -> FlatTree {
        self.entries
            .iter()
            .filter_map(|(path, slot)| slot.resolved().map(|b| (path.clone(), b.flat())))
            .collect()
    }

    /// Write the index as a tree hierarchy and return the root tree id.
    /// Subtrees that already exist in the store are not written again.
    ///
    /// # Errors
    /// Returns [`KeelError::UnmergedPathsConflict`] if conflicts remain, or a
    /// store error.
    pub fn write_tree(&self, store: &dyn ObjectStore) -> KeelResult<ObjectId> {
        let flat = self.to_flat()?;
        Ok(build_tree(store, &flat)?)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::MemoryObjectStore;

    fn blob(content: &[u8]) -> StagedBlob {
        StagedBlob::new(ObjectId::for_blob(content), EntryMode::Blob)
    }

    #[test]
    fn resolved_and_conflicted_slots() {
        let mut index = Index::new();
        index.set_resolved("a.txt", blob(b"a"));
        index.set_conflicted("b.txt", Some(blob(b"base")), Some(blob(b"o")), None);

        assert!(index.has_conflicts());
        assert_eq!(index.conflicts(), vec!["b.txt".to_owned()]);
        assert_eq!(index.resolved("a.txt"), Some(&blob(b"a")));
        assert_eq!(index.resolved("b.txt"), None);

        let rows: Vec<(&str, u8)> = index
            .entries()
            .iter()
            .map(|e| (e.path, e.stage.number()))
            .collect();
        assert_eq!(rows, vec![("a.txt", 0), ("b.txt", 1), ("b.txt", 2)]);
    }

    #[test]
    fn empty_conflict_removes_path() {
        let mut index = Index::new();
        index.set_resolved("a", blob(b"a"));
        index.set_conflicted("a", None, None, None);
        assert!(!index.contains("a"));
    }

    #[test]
    fn to_flat_reports_unmerged_paths() {
        let mut index = Index::new();
        index.set_conflicted("z", None, Some(blob(b"1")), Some(blob(b"2")));
        index.set_conflicted("y", Some(blob(b"0")), None, Some(blob(b"2")));
        match index.to_flat().unwrap_err() {
            KeelError::UnmergedPathsConflict { paths } => {
                assert_eq!(paths, vec!["y".to_owned(), "z".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn write_tree_reuses_unchanged_subtrees() {
        let store = MemoryObjectStore::new();
        let a = store.write_blob(b"a").unwrap();
        let b = store.write_blob(b"b").unwrap();
        let mut index = Index::new();
        index.set_resolved("dir/a", StagedBlob::new(a, EntryMode::Blob));
        index.set_resolved("top", StagedBlob::new(b, EntryMode::Blob));

        let first = index.write_tree(&store).unwrap();
        let objects = store.len();
        let second = index.write_tree(&store).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), objects);

        index.set_resolved("top", StagedBlob::new(a, EntryMode::Blob));
        index.write_tree(&store).unwrap();
        // only a new root: `dir` is unchanged
        assert_eq!(store.len(), objects + 1);
    }

    #[test]
    fn json_round_trip_keeps_conflicts_and_stats() {
        let mut index = Index::new();
        let stat = StatCache {
            size: 1,
            mtime_secs: 10,
            mtime_nanos: 5,
        };
        index.set_resolved("a", blob(b"a").with_stat(Some(stat)));
        index.set_conflicted("b", None, Some(blob(b"o")), Some(blob(b"t")));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, index.to_bytes().unwrap()).unwrap();
        assert_eq!(Index::load(&path).unwrap(), index);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Index::load(&dir.path().join("index.json")).unwrap().is_empty());
    }

    #[test]
    fn recent_mtime_is_not_trusted() {
        let stat = FileStat {
            size: 3,
            mtime_secs: now_secs(),
            mtime_nanos: 0,
            mode: EntryMode::Blob,
        };
        let cache = StatCache::from_stat(&stat);
        assert!(!cache.vouches_for(&stat));

        let old = FileStat {
            mtime_secs: 1_000,
            ..stat
        };
        assert!(StatCache::from_stat(&old).vouches_for(&old));
        let grown = FileStat { size: 4, ..old };
        assert!(!StatCache::from_stat(&old).vouches_for(&grown));
    }
}
