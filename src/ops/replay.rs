//! Cherry-pick and revert: replaying one commit's change, forwards or
//! backwards, on top of HEAD.

use keel_core::merge::{TreeMergeOptions, merge_trees};
use keel_core::{FlatTree, build_tree, flatten_commit};
use keel_store::{Commit, ObjectId, Signature};
use tracing::{info, instrument, warn};

use super::{OperationOutcome, conflict_target, conflicted_paths, require_index_at_head};
use crate::checkout::{CancelToken, Materialize, PlanMode, target_from_flat};
use crate::error::{KeelError, KeelResult};
use crate::fp;
use crate::graph::select_parent;
use crate::head::{Head, advance_head};
use crate::repo::Repository;
use crate::revision::resolve_commit;
use crate::state::{OperationKind, OperationState};

/// Options for [`Repository::cherry_pick`] and [`Repository::revert`].
#[derive(Clone, Debug, Default)]
pub struct ReplayOptions {
    /// 1-based parent to diff against; required for merge commits.
    pub mainline: Option<usize>,
    /// Record a commit even when the result equals HEAD's tree.
    pub allow_empty: bool,
    /// Defaults to the repository identity.
    pub committer: Option<Signature>,
    pub cancel: Option<CancelToken>,
}

impl Repository {
    /// Apply the change `rev` introduced (relative to its selected parent)
    /// as a new commit on HEAD, keeping the original author and message.
    ///
    /// # Errors
    /// As [`revert`](Self::revert).
    pub fn cherry_pick(&self, rev: &str, opts: &ReplayOptions) -> KeelResult<OperationOutcome> {
        self.replay(OperationKind::CherryPick, rev, opts)
    }

    /// Apply the inverse of the change `rev` introduced as a new commit on
    /// HEAD.
    ///
    /// # Errors
    /// - [`KeelError::AmbiguousRevision`] for a merge commit without
    ///   `mainline`, [`KeelError::InvalidRevision`] for a bad one
    /// - [`KeelError::OperationInProgress`] or
    ///   [`KeelError::UnmergedPathsConflict`] if a previous operation is
    ///   unfinished
    /// - [`KeelError::CheckoutConflict`] if the index differs from HEAD or
    ///   local changes would be overwritten
    pub fn revert(&self, rev: &str, opts: &ReplayOptions) -> KeelResult<OperationOutcome> {
        self.replay(OperationKind::Revert, rev, opts)
    }

    #[instrument(skip_all, fields(kind = %kind, rev = %rev))]
    fn replay(
        &self,
        kind: OperationKind,
        rev: &str,
        opts: &ReplayOptions,
    ) -> KeelResult<OperationOutcome> {
        let reverting = kind == OperationKind::Revert;
        self.require_worktree(if reverting { "revert" } else { "cherry-pick" })?;
        let guard = self.lock_index()?;
        self.ensure_no_operation()?;
        let conflicts = guard.index().conflicts();
        if !conflicts.is_empty() {
            return Err(KeelError::UnmergedPathsConflict { paths: conflicts });
        }

        let head = self.head()?;
        let head_flat = self.flat_of(head.commit())?;
        require_index_at_head(guard.index(), &head_flat)?;

        let oid = resolve_commit(self.objects(), self.refs(), rev)?;
        let picked = self.objects().read_commit(oid)?;
        let parent = select_parent(self.objects(), oid, opts.mainline)?;
        let parent_flat = self.flat_of(parent)?;
        let commit_flat = flatten_commit(self.objects(), oid)?;

        let short = oid.short();
        let (ancestor, theirs, theirs_label) = if reverting {
            (commit_flat, parent_flat, format!("parent of {short}"))
        } else {
            (
                parent_flat,
                commit_flat,
                format!("{short} ({})", picked.summary()),
            )
        };
        let outcome = merge_trees(
            self.objects(),
            &ancestor,
            &head_flat,
            &theirs,
            &TreeMergeOptions {
                markers: self.marker_style("HEAD", &theirs_label),
                virtual_ancestor: false,
            },
        )?;

        let (message, author) = if reverting {
            let message = format!(
                "Revert \"{}\"\n\nThis reverts commit {oid}.\n",
                picked.summary()
            );
            (message, None)
        } else {
            (picked.message.clone(), Some(picked.author.clone()))
        };

        if !outcome.is_clean() {
            let target = conflict_target(&outcome);
            let guard = self.materialize(
                guard,
                &Materialize {
                    mode: PlanMode::Switch,
                    head: &head_flat,
                    target: &target,
                    force: false,
                },
                opts.cancel.as_ref(),
            )?;
            let mut state = OperationState::new(kind, head.commit(), oid, message);
            state.author = author;
            state.conflicts = outcome.conflicts.iter().map(|c| c.path.clone()).collect();
            if let Err(err) = state.write_atomic(&self.state_path()) {
                self.roll_back(guard, head.commit(), &err);
                return Err(err);
            }
            guard.commit()?;
            warn!(conflicts = state.conflicts.len(), "{kind} stopped on conflicts");
            return Ok(OperationOutcome::Conflicts(conflicted_paths(&outcome)));
        }

        if outcome.merged == head_flat && !opts.allow_empty {
            info!("change already present");
            return Ok(OperationOutcome::UpToDate);
        }

        let committer = match &opts.committer {
            Some(sig) => sig.clone(),
            None => self.identity()?,
        };
        let target = target_from_flat(&outcome.merged);
        let guard = self.materialize(
            guard,
            &Materialize {
                mode: PlanMode::Switch,
                head: &head_flat,
                target: &target,
                force: false,
            },
            opts.cancel.as_ref(),
        )?;
        let author = author.unwrap_or_else(|| committer.clone());
        let recorded =
            self.record_replay(kind, &head, &outcome.merged, author, &committer, message);
        let new = match recorded {
            Ok(new) => new,
            Err(err) => {
                self.roll_back(guard, head.commit(), &err);
                return Err(err);
            }
        };
        guard.commit()?;
        info!(commit = %new, "{kind} committed");
        Ok(OperationOutcome::NonFastForward { commit: new })
    }

    /// Write the replayed commit on top of HEAD and move HEAD to it.
    fn record_replay(
        &self,
        kind: OperationKind,
        head: &Head,
        merged: &FlatTree,
        author: Signature,
        committer: &Signature,
        message: String,
    ) -> KeelResult<ObjectId> {
        let commit = Commit {
            tree: build_tree(self.objects(), merged)?,
            parents: head.commit().into_iter().collect(),
            author,
            committer: committer.clone(),
            message,
        };
        let reflog = format!("{kind}: {}", commit.summary());
        let new = self.objects().write_commit(commit)?;
        fp!("FP_REPLAY_BEFORE_REF_UPDATE")?;
        advance_head(self.refs(), head, new, committer, &reflog)?;
        Ok(new)
    }
}
