//! Moving HEAD without a new commit: reset, and abort of a stopped
//! operation.

use keel_core::FlatTree;
use keel_store::ObjectId;
use tracing::{info, instrument, warn};

use crate::checkout::{Materialize, PlanMode, target_from_flat};
use crate::error::{KeelError, KeelResult};
use crate::head::{advance_head, set_orig_head};
use crate::index::{Index, Slot};
use crate::lock::IndexGuard;
use crate::repo::Repository;
use crate::revision::resolve_commit;
use crate::state::OperationState;

/// How much of the repository a reset rewrites.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResetMode {
    /// HEAD only.
    Soft,
    /// HEAD and the index; working-tree edits become unstaged changes.
    #[default]
    Mixed,
    /// HEAD, index and working tree, discarding local changes.
    Hard,
}

impl std::fmt::Display for ResetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Mixed => write!(f, "mixed"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

impl Repository {
    /// Move HEAD (or the branch it is attached to) to `rev`, recording the
    /// previous commit in `ORIG_HEAD`. Mixed and hard resets also discard
    /// any in-progress operation; untracked files are never touched.
    ///
    /// # Errors
    /// - [`KeelError::InvalidOperationOnBareRepository`] for a hard reset of
    ///   a bare repository
    /// - [`KeelError::UnmergedPathsConflict`] for a soft reset over
    ///   conflicts
    /// - [`KeelError::LockContention`] if HEAD moved concurrently
    #[instrument(skip_all, fields(rev = %rev, mode = %mode))]
    pub fn reset(&self, rev: &str, mode: ResetMode) -> KeelResult<ObjectId> {
        if mode == ResetMode::Hard {
            self.require_worktree("reset --hard")?;
        }
        let mut guard = self.lock_index()?;
        let head = self.head()?;
        let commit = resolve_commit(self.objects(), self.refs(), rev)?;
        let target_flat = self.flat_of(Some(commit))?;

        match mode {
            ResetMode::Soft => {
                let conflicts = guard.index().conflicts();
                if !conflicts.is_empty() {
                    return Err(KeelError::UnmergedPathsConflict { paths: conflicts });
                }
            }
            ResetMode::Mixed => {
                let index = reset_index(guard.index(), &target_flat);
                guard.replace(index);
            }
            ResetMode::Hard => {
                guard = self.force_tree(guard, head.commit(), &target_flat)?;
            }
        }

        if let Some(previous) = head.commit() {
            set_orig_head(self.refs(), previous)?;
        }
        advance_head(
            self.refs(),
            &head,
            commit,
            &self.reflog_signature(),
            &format!("reset: moving to {rev}"),
        )?;
        if mode != ResetMode::Soft {
            OperationState::remove(&self.state_path())?;
        }
        guard.commit()?;
        info!(commit = %commit, "reset");
        Ok(commit)
    }

    /// Abandon a stopped merge, cherry-pick or revert: restore the index and
    /// working tree to the commit HEAD was at when it started and delete
    /// the operation record.
    ///
    /// # Errors
    /// [`KeelError::NoOperationInProgress`] if nothing is recorded.
    #[instrument(skip_all)]
    pub fn abort_operation(&self) -> KeelResult<()> {
        let op = self
            .operation_state()?
            .ok_or(KeelError::NoOperationInProgress)?;
        let guard = self.lock_index()?;
        let head = self.head()?;
        let target_flat = self.flat_of(op.head_before)?;
        let guard = self.force_tree(guard, head.commit(), &target_flat)?;

        if let Some(before) = op.head_before.filter(|b| head.commit() != Some(*b)) {
            warn!(from = ?head.commit(), to = %before, "HEAD moved during the operation; restoring it");
            advance_head(
                self.refs(),
                &head,
                before,
                &self.reflog_signature(),
                &format!("{}: abort", op.kind),
            )?;
        }
        OperationState::remove(&self.state_path())?;
        guard.commit()?;
        info!(kind = %op.kind, "operation aborted");
        Ok(())
    }

    /// Put the index and working tree back at `head` after an operation
    /// failed between updating the working tree and moving any ref. A
    /// failed restore is logged; the caller still reports `cause`.
    pub(crate) fn roll_back(
        &self,
        guard: IndexGuard,
        head: Option<ObjectId>,
        cause: &KeelError,
    ) {
        warn!(error = %cause, "operation failed after updating files, restoring HEAD");
        let restored = self
            .flat_of(head)
            .and_then(|flat| self.force_tree(guard, head, &flat))
            .and_then(IndexGuard::commit);
        if let Err(err) = restored {
            warn!(error = %err, "could not restore HEAD; reset --hard recovers");
        }
    }

    /// Force the index (and working tree, if any) to exactly `target`.
    fn force_tree(
        &self,
        guard: IndexGuard,
        head: Option<ObjectId>,
        target: &FlatTree,
    ) -> KeelResult<IndexGuard> {
        let head_flat = self.flat_of(head)?;
        let target = target_from_flat(target);
        self.materialize(
            guard,
            &Materialize {
                mode: PlanMode::Switch,
                head: &head_flat,
                target: &target,
                force: true,
            },
            None,
        )
    }
}

/// The index a mixed reset leaves: exactly `target`, keeping stat caches of
/// entries whose blob did not change.
fn reset_index(current: &Index, target: &FlatTree) -> Index {
    let mut index = Index::from_flat(target);
    for (path, entry) in target {
        if let Some(Slot::Resolved(old)) = current.get(path) {
            if old.flat() == *entry {
                index.refresh_stat(path, old.stat);
            }
        }
    }
    index
}
