//! Commit ancestry: merge bases, reachability and parent selection.

use std::collections::{HashMap, HashSet, VecDeque};

use keel_store::{Commit, ObjectId, ObjectStore};
use tracing::{debug, instrument};

use crate::error::{KeelError, KeelResult};

/// Most inputs [`merge_bases`] accepts (one bit each in the paint mask).
pub const MAX_MERGE_BASE_INPUTS: usize = 64;

/// Commits read during one walk, keyed by id.
struct CommitCache<'a> {
    store: &'a dyn ObjectStore,
    commits: HashMap<ObjectId, Commit>,
}

impl<'a> CommitCache<'a> {
    fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            commits: HashMap::new(),
        }
    }

    fn get(&mut self, oid: ObjectId) -> KeelResult<&Commit> {
        if !self.commits.contains_key(&oid) {
            let commit = self.store.read_commit(oid)?;
            self.commits.insert(oid, commit);
        }
        self.commits
            .get(&oid)
            .ok_or(KeelError::ObjectNotFound { oid })
    }

    fn parents(&mut self, oid: ObjectId) -> KeelResult<Vec<ObjectId>> {
        Ok(self.get(oid)?.parents.clone())
    }

    fn committer_time(&mut self, oid: ObjectId) -> KeelResult<i64> {
        Ok(self.get(oid)?.committer.when.seconds)
    }
}

/// The best common ancestors of `commits`.
///
/// Every ancestor is painted with the set of inputs that reach it. Commits
/// painted by all inputs are candidates; a candidate that is an ancestor of
/// another candidate is dropped. All remaining candidates are returned,
/// newest committer time first, ties by id. Unrelated histories give an
/// empty list.
///
/// # Errors
/// Returns [`KeelError::InvalidRevision`] for more than
/// [`MAX_MERGE_BASE_INPUTS`] inputs, or a store error for a missing commit.
#[instrument(skip_all, fields(inputs = commits.len()))]
pub fn merge_bases(store: &dyn ObjectStore, commits: &[ObjectId]) -> KeelResult<Vec<ObjectId>> {
    if commits.len() > MAX_MERGE_BASE_INPUTS {
        return Err(KeelError::InvalidRevision {
            spec: format!("{} commits", commits.len()),
            reason: format!("merge base of more than {MAX_MERGE_BASE_INPUTS} commits"),
        });
    }
    let Some(&first) = commits.first() else {
        return Ok(Vec::new());
    };
    if commits.iter().all(|c| *c == first) {
        store.read_commit(first)?;
        return Ok(vec![first]);
    }

    let mut cache = CommitCache::new(store);
    let full: u64 = if commits.len() == 64 {
        u64::MAX
    } else {
        (1u64 << commits.len()) - 1
    };

    // Propagate paint until no commit gains a new bit.
    let mut paint: HashMap<ObjectId, u64> = HashMap::new();
    let mut queue: VecDeque<ObjectId> = VecDeque::new();
    for (i, oid) in commits.iter().enumerate() {
        *paint.entry(*oid).or_default() |= 1u64 << i;
        queue.push_back(*oid);
    }
    while let Some(oid) = queue.pop_front() {
        let mask = paint.get(&oid).copied().unwrap_or_default();
        for parent in cache.parents(oid)? {
            let slot = paint.entry(parent).or_default();
            if *slot | mask != *slot {
                *slot |= mask;
                queue.push_back(parent);
            }
        }
    }

    let candidates: HashSet<ObjectId> = paint
        .iter()
        .filter(|(_, mask)| **mask == full)
        .map(|(oid, _)| *oid)
        .collect();

    // Anything reachable from a candidate's parents is an older candidate.
    let mut redundant: HashSet<ObjectId> = HashSet::new();
    let mut walk: VecDeque<ObjectId> = VecDeque::new();
    for oid in &candidates {
        walk.extend(cache.parents(*oid)?);
    }
    while let Some(oid) = walk.pop_front() {
        if redundant.insert(oid) {
            walk.extend(cache.parents(oid)?);
        }
    }

    let mut bases: Vec<(i64, ObjectId)> = Vec::new();
    for oid in candidates.difference(&redundant) {
        bases.push((cache.committer_time(*oid)?, *oid));
    }
    bases.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let bases: Vec<ObjectId> = bases.into_iter().map(|(_, oid)| oid).collect();
    debug!(count = bases.len(), "merge bases computed");
    Ok(bases)
}

/// `true` if `ancestor` is `descendant` or reachable from it.
///
/// # Errors
/// Returns a store error for a missing commit.
pub fn is_ancestor(
    store: &dyn ObjectStore,
    ancestor: ObjectId,
    descendant: ObjectId,
) -> KeelResult<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let mut cache = CommitCache::new(store);
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([descendant]);
    while let Some(oid) = queue.pop_front() {
        for parent in cache.parents(oid)? {
            if parent == ancestor {
                return Ok(true);
            }
            if seen.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}

/// The parent of `commit` that cherry-pick or revert diff against.
///
/// `mainline` is 1-based. A root commit has no parent (`Ok(None)`). A merge
/// commit needs an explicit `mainline`.
///
/// # Errors
/// Returns [`KeelError::AmbiguousRevision`] for a merge commit without a
/// `mainline`, or [`KeelError::InvalidRevision`] if `mainline` is out of
/// range.
pub fn select_parent(
    store: &dyn ObjectStore,
    commit: ObjectId,
    mainline: Option<usize>,
) -> KeelResult<Option<ObjectId>> {
    let parents = store.read_commit(commit)?.parents;
    match (parents.len(), mainline) {
        (0, None) => Ok(None),
        (1, None) => Ok(Some(parents[0])),
        (_, None) => Err(KeelError::AmbiguousRevision {
            spec: commit.to_string(),
            candidates: parents
                .iter()
                .enumerate()
                .map(|(i, p)| format!("mainline {} ({})", i + 1, p.short()))
                .collect(),
        }),
        (n, Some(m)) => {
            if m == 0 || m > n {
                Err(KeelError::InvalidRevision {
                    spec: commit.to_string(),
                    reason: format!("commit has {n} parent(s); mainline {m} is out of range"),
                })
            } else {
                Ok(Some(parents[m - 1]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::{MemoryObjectStore, Signature, Timestamp, Tree};

    struct Graph {
        store: MemoryObjectStore,
        tree: ObjectId,
    }

    impl Graph {
        fn new() -> Self {
            let store = MemoryObjectStore::new();
            let tree = store.write_tree(Tree::empty()).unwrap();
            Self { store, tree }
        }

        fn commit(&self, parents: &[ObjectId], time: i64, message: &str) -> ObjectId {
            let sig = Signature::new("t", "t@example.com", Timestamp::new(time, 0));
            self.store
                .write_commit(Commit {
                    tree: self.tree,
                    parents: parents.to_vec(),
                    author: sig.clone(),
                    committer: sig,
                    message: message.to_owned(),
                })
                .unwrap()
        }
    }

    #[test]
    fn linear_history() {
        let g = Graph::new();
        let a = g.commit(&[], 1, "a");
        let b = g.commit(&[a], 2, "b");
        let c = g.commit(&[b], 3, "c");
        assert_eq!(merge_bases(&g.store, &[b, c]).unwrap(), vec![b]);
        assert_eq!(merge_bases(&g.store, &[c, a]).unwrap(), vec![a]);
        assert!(is_ancestor(&g.store, a, c).unwrap());
        assert!(!is_ancestor(&g.store, c, a).unwrap());
    }

    #[test]
    fn simple_fork() {
        let g = Graph::new();
        let base = g.commit(&[], 1, "base");
        let left = g.commit(&[base], 2, "left");
        let right = g.commit(&[base], 3, "right");
        assert_eq!(merge_bases(&g.store, &[left, right]).unwrap(), vec![base]);
    }

    #[test]
    fn criss_cross_reports_both_bases() {
        let g = Graph::new();
        let root = g.commit(&[], 1, "root");
        let x = g.commit(&[root], 2, "x");
        let y = g.commit(&[root], 3, "y");
        // each side merges the other's tip
        let left = g.commit(&[x, y], 4, "left");
        let right = g.commit(&[y, x], 5, "right");

        let bases = merge_bases(&g.store, &[left, right]).unwrap();
        assert_eq!(bases, vec![y, x], "newest first");
        assert_eq!(bases, merge_bases(&g.store, &[right, left]).unwrap());
    }

    #[test]
    fn unrelated_histories_have_no_base() {
        let g = Graph::new();
        let a = g.commit(&[], 1, "a");
        let b = g.commit(&[], 2, "b");
        assert!(merge_bases(&g.store, &[a, b]).unwrap().is_empty());
    }

    #[test]
    fn three_way_octopus_base() {
        let g = Graph::new();
        let base = g.commit(&[], 1, "base");
        let mid = g.commit(&[base], 2, "mid");
        let a = g.commit(&[mid], 3, "a");
        let b = g.commit(&[mid], 4, "b");
        let c = g.commit(&[base], 5, "c");
        assert_eq!(merge_bases(&g.store, &[a, b, c]).unwrap(), vec![base]);
        assert_eq!(merge_bases(&g.store, &[a, b]).unwrap(), vec![mid]);
    }

    #[test]
    fn too_many_inputs_rejected() {
        let g = Graph::new();
        let a = g.commit(&[], 1, "a");
        let many = vec![a; MAX_MERGE_BASE_INPUTS + 1];
        assert!(matches!(
            merge_bases(&g.store, &many),
            Err(KeelError::InvalidRevision { .. })
        ));
    }

    #[test]
    fn parent_selection() {
        let g = Graph::new();
        let root = g.commit(&[], 1, "root");
        let a = g.commit(&[root], 2, "a");
        let b = g.commit(&[root], 3, "b");
        let merge = g.commit(&[a, b], 4, "merge");

        assert_eq!(select_parent(&g.store, root, None).unwrap(), None);
        assert_eq!(select_parent(&g.store, a, None).unwrap(), Some(root));
        assert_eq!(select_parent(&g.store, a, Some(1)).unwrap(), Some(root));
        assert!(matches!(
            select_parent(&g.store, merge, None),
            Err(KeelError::AmbiguousRevision { .. })
        ));
        assert_eq!(select_parent(&g.store, merge, Some(2)).unwrap(), Some(b));
        assert!(matches!(
            select_parent(&g.store, merge, Some(3)),
            Err(KeelError::InvalidRevision { .. })
        ));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Bases do not depend on input order, and each base is an
            /// ancestor of every input.
            #[test]
            fn bases_are_symmetric(
                extra in proptest::collection::vec((1usize..10, 0usize..10), 0..12),
                i in 0usize..10,
                j in 0usize..10,
            ) {
                let g = Graph::new();
                let mut ids: Vec<ObjectId> = Vec::new();
                for n in 0..10usize {
                    let mut parents: Vec<ObjectId> = Vec::new();
                    if n > 0 {
                        // odd steps branch off an earlier commit
                        parents.push(ids[if n % 2 == 0 { n - 1 } else { n / 2 }]);
                    }
                    for (child, parent) in &extra {
                        let p = ids.get(parent % n.max(1)).copied();
                        if *child == n && let Some(p) = p && !parents.contains(&p) {
                            parents.push(p);
                        }
                    }
                    ids.push(g.commit(&parents, i64::try_from(n).unwrap(), &format!("c{n}")));
                }
                let (x, y) = (ids[i], ids[j]);
                let ab = merge_bases(&g.store, &[x, y]).unwrap();
                let ba = merge_bases(&g.store, &[y, x]).unwrap();
                prop_assert_eq!(&ab, &ba);
                for base in &ab {
                    prop_assert!(is_ancestor(&g.store, *base, x).unwrap());
                    prop_assert!(is_ancestor(&g.store, *base, y).unwrap());
                }
                for a in &ab {
                    for b in &ab {
                        prop_assert!(a == b || !is_ancestor(&g.store, *a, *b).unwrap());
                    }
                }
            }
        }
    }
}
