//! The mutating operations, as `impl Repository` blocks.
//!
//! Every operation follows the same order:
//!
//! 1. take the index lock ([`crate::lock::IndexGuard`]) and read HEAD;
//! 2. compute the new tree or plan, refusing on conflicts before any write;
//! 3. update the working tree and the in-memory index;
//! 4. compare-and-set the refs against the values read in step 1;
//! 5. write the index and release the lock.
//!
//! A failure in step 4 drops the guard, so the on-disk index is unchanged.
//! Merge-family conflicts are a normal [`OperationOutcome`], not an error.

mod branch;
mod clean;
mod commit;
mod merge;
mod replay;
mod reset;
mod stage;
mod status;
mod switch;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeSet;

use keel_core::FlatTree;
use keel_core::merge::{ConflictReason, PathConflict, TreeMergeOutcome};
use keel_store::ObjectId;
use tracing::warn;

use crate::checkout::{Target, TargetEntry, target_from_flat};
use crate::error::{KeelError, KeelResult};
use crate::index::{Index, Slot, StagedBlob};

pub use clean::CleanOptions;
pub use commit::CommitOptions;
pub use merge::{FastForward, MergeOptions};
pub use replay::ReplayOptions;
pub use reset::ResetMode;
pub use status::{ChangeKind, Status};
pub use switch::{CheckoutPathsOptions, PathSource};

/// What a merge, cherry-pick or revert did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Nothing to do; HEAD, index and files are untouched.
    UpToDate,
    /// HEAD moved forward to `commit` without a new commit.
    FastForward { commit: ObjectId },
    /// A new commit was created and HEAD points at it.
    NonFastForward { commit: ObjectId },
    /// The operation stopped; the index holds the stages listed here and
    /// the working tree holds conflict markers. HEAD did not move.
    Conflicts(Vec<ConflictedPath>),
}

impl OperationOutcome {
    /// The commit HEAD now points at, when it moved.
    #[must_use]
    pub const fn commit(&self) -> Option<ObjectId> {
        match self {
            Self::FastForward { commit } | Self::NonFastForward { commit } => Some(*commit),
            Self::UpToDate | Self::Conflicts(_) => None,
        }
    }
}

/// One conflicted path, mirroring its index stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictedPath {
    pub path: String,
    pub reason: ConflictReason,
    pub ancestor: Option<StagedBlob>,
    pub ours: Option<StagedBlob>,
    pub theirs: Option<StagedBlob>,
}

impl From<&PathConflict> for ConflictedPath {
    fn from(c: &PathConflict) -> Self {
        Self {
            path: c.path.clone(),
            reason: c.reason,
            ancestor: c.ancestor.map(StagedBlob::from),
            ours: c.ours.map(StagedBlob::from),
            theirs: c.theirs.map(StagedBlob::from),
        }
    }
}

/// The index and working tree a merge result should leave behind: clean
/// paths resolved, conflicted paths staged with the marked-up file.
fn conflict_target(outcome: &TreeMergeOutcome) -> Target {
    let mut target = target_from_flat(&outcome.merged);
    for c in &outcome.conflicts {
        let path = ConflictedPath::from(c);
        target.insert(
            c.path.clone(),
            TargetEntry {
                slot: Slot::Conflicted {
                    ancestor: path.ancestor,
                    ours: path.ours,
                    theirs: path.theirs,
                },
                file: c.worktree_entry(),
            },
        );
    }
    target
}

/// Merge-family operations start from an index equal to HEAD; staged
/// changes would otherwise be folded into the result.
fn require_index_at_head(index: &Index, head: &FlatTree) -> KeelResult<()> {
    let staged = index.to_flat()?;
    if staged == *head {
        return Ok(());
    }
    let paths: BTreeSet<String> = staged
        .keys()
        .chain(head.keys())
        .filter(|p| staged.get(*p) != head.get(*p))
        .cloned()
        .collect();
    warn!(paths = paths.len(), "index differs from HEAD");
    Err(KeelError::CheckoutConflict {
        paths: paths.into_iter().collect(),
    })
}

fn conflicted_paths(outcome: &TreeMergeOutcome) -> Vec<ConflictedPath> {
    outcome.conflicts.iter().map(ConflictedPath::from).collect()
}
