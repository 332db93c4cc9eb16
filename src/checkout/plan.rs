//! Deciding, per path, what a checkout must do and whether it is safe.

use std::collections::BTreeSet;

use keel_core::FlatEntry;
use keel_store::{FileStat, ObjectId, WorkTree};
use tracing::{debug, instrument};

use super::{Materialize, PlanMode};
use crate::error::KeelResult;
use crate::index::{Index, Slot, StagedBlob, StatCache};

/// What happens to the working-tree file at a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileChange {
    /// The file already holds the target content (or both lack it).
    Keep,
    Write(FlatEntry),
    Remove,
}

/// One path's update: the new index slot (`None` removes the path from the
/// index) and the file change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub slot: Option<Slot>,
    pub file: FileChange,
}

/// The outcome of planning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckoutPlan {
    pub changes: Vec<Change>,
    /// Paths whose local changes would be lost, sorted. Empty for forced
    /// plans.
    pub blocking: Vec<String>,
}

impl CheckoutPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes in execution order: removals deepest first, then everything
    /// else by path.
    #[must_use]
    pub fn ordered(&self) -> Vec<&Change> {
        let mut removals: Vec<&Change> = self
            .changes
            .iter()
            .filter(|c| c.file == FileChange::Remove)
            .collect();
        removals.sort_by(|a, b| {
            depth(&b.path)
                .cmp(&depth(&a.path))
                .then_with(|| a.path.cmp(&b.path))
        });
        removals.extend(self.changes.iter().filter(|c| c.file != FileChange::Remove));
        removals
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Plan `request` against the current index and working tree.
///
/// Nothing is modified. In a non-forced plan a path is updated only when no
/// local work is lost: either the index matches HEAD and the file matches
/// the index, or the file already holds the target content and the index
/// holds nothing HEAD and the target lack. Anything else is blocking.
///
/// # Errors
/// Returns a store error if the working tree cannot be read.
#[instrument(skip_all, fields(mode = ?request.mode, force = request.force, targets = request.target.len()))]
pub fn plan(
    worktree: &dyn WorkTree,
    index: &Index,
    request: &Materialize<'_>,
) -> KeelResult<CheckoutPlan> {
    let Materialize {
        mode,
        head,
        target,
        force,
    } = *request;

    let paths: BTreeSet<&str> = match mode {
        PlanMode::Switch => head
            .keys()
            .map(String::as_str)
            .chain(index.paths())
            .chain(target.keys().map(String::as_str))
            .collect(),
        PlanMode::Paths => target.keys().map(String::as_str).collect(),
    };
    let files: BTreeSet<String> = worktree.list()?.into_iter().collect();
    // A file on disk survives the plan when the target keeps it or nothing
    // tracks it.
    let survives = |p: &str| {
        target.contains_key(p)
            || (!index.contains(p) && !head.contains_key(p))
            || (mode == PlanMode::Paths && index.contains(p))
    };

    let mut plan = CheckoutPlan::default();
    for path in paths {
        let head_entry = head.get(path).copied();
        let slot = index.get(path);
        let conflicted = slot.is_some_and(Slot::is_conflicted);
        let staged = slot.and_then(Slot::resolved).copied();
        let wanted = target.get(path);
        let wanted_slot = wanted.map(|t| t.slot);
        let wanted_file = wanted.and_then(|t| t.file);

        let stat = worktree.stat(path)?;
        let hint = staged.filter(|b| Some(b.flat()) == wanted_file).and_then(|b| b.stat);
        let on_disk_is_target = file_matches(worktree, path, stat.as_ref(), wanted_file, hint)?;

        if Slot::same_content(slot, wanted_slot.as_ref()) && on_disk_is_target {
            continue;
        }

        if mode == PlanMode::Switch && !force && !conflicted {
            let target_is_head = match wanted {
                None => head_entry.is_none(),
                Some(t) => {
                    !t.slot.is_conflicted()
                        && t.resolved_entry() == head_entry
                        && t.file == head_entry
                }
            };
            if target_is_head {
                continue;
            }
        }

        if !force {
            let staged_flat = staged.map(|b| b.flat());
            let clean = !conflicted
                && file_matches(
                    worktree,
                    path,
                    stat.as_ref(),
                    staged_flat,
                    staged.and_then(|b| b.stat),
                )?;
            let safe = match mode {
                PlanMode::Switch => {
                    let index_is_head = !conflicted && staged_flat == head_entry;
                    let index_expendable =
                        index_is_head || Slot::same_content(slot, wanted_slot.as_ref());
                    (index_is_head && clean) || (on_disk_is_target && index_expendable)
                }
                PlanMode::Paths => clean || on_disk_is_target,
            };
            let clash = wanted_file.is_some()
                && !on_disk_is_target
                && blocked_by_other_files(path, &files, &survives);
            if !safe || clash {
                plan.blocking.push(path.to_owned());
                continue;
            }
        }

        let file = match wanted_file {
            _ if on_disk_is_target => FileChange::Keep,
            Some(entry) => FileChange::Write(entry),
            None => FileChange::Remove,
        };
        plan.changes.push(Change {
            path: path.to_owned(),
            slot: wanted_slot,
            file,
        });
    }

    debug!(
        changes = plan.changes.len(),
        blocking = plan.blocking.len(),
        "checkout planned"
    );
    Ok(plan)
}

/// `true` if writing a file at `path` would collide with a surviving file
/// below it (`path/...`) or at one of its parent directories.
fn blocked_by_other_files(
    path: &str,
    files: &BTreeSet<String>,
    survives: &impl Fn(&str) -> bool,
) -> bool {
    let dir_prefix = format!("{path}/");
    let below = files
        .range(dir_prefix.clone()..)
        .take_while(|f| f.starts_with(&dir_prefix))
        .any(|f| survives(f));
    if below {
        return true;
    }
    let mut parent = path;
    while let Some((up, _)) = parent.rsplit_once('/') {
        if files.contains(up) && survives(up) {
            return true;
        }
        parent = up;
    }
    false
}

/// `true` if the working-tree file at `path` holds `expected` (or both are
/// absent). A trusted stat cache skips hashing.
pub(crate) fn file_matches(
    worktree: &dyn WorkTree,
    path: &str,
    stat: Option<&FileStat>,
    expected: Option<FlatEntry>,
    cache: Option<StatCache>,
) -> KeelResult<bool> {
    match (stat, expected) {
        (None, None) => Ok(true),
        (None, Some(_)) | (Some(_), None) => Ok(false),
        (Some(stat), Some(expected)) => {
            if stat.mode != expected.mode {
                return Ok(false);
            }
            if cache.is_some_and(|c| c.vouches_for(stat)) {
                return Ok(true);
            }
            let content = worktree.read(path)?;
            Ok(ObjectId::for_blob(&content) == expected.oid)
        }
    }
}

/// The stat cache to record for a file just written as `blob`.
pub(crate) fn fresh_stat(
    worktree: &dyn WorkTree,
    path: &str,
    blob: &StagedBlob,
) -> KeelResult<Option<StatCache>> {
    Ok(worktree
        .stat(path)?
        .filter(|s| s.mode == blob.mode)
        .map(|s| StatCache::from_stat(&s)))
}
