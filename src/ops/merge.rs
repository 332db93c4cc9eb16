//! Merging another commit into HEAD.
//!
//! The ancestor for the three-way merge is the merge base of HEAD and the
//! other commit. When there are several (criss-cross history) they are
//! merged pairwise into a virtual commit that stands in as the ancestor.
//! Virtual commits are written to the object store but never referenced.

use keel_core::merge::{MarkerStyle, TreeMergeOptions, merge_trees};
use keel_core::{FlatTree, build_tree, flatten_commit};
use keel_store::{Commit, ObjectId, ObjectStore, Signature, Timestamp};
use tracing::{debug, info, instrument, warn};

use super::{OperationOutcome, conflict_target, conflicted_paths, require_index_at_head};
use crate::checkout::{CancelToken, Materialize, PlanMode, target_from_flat};
use crate::error::{KeelError, KeelResult};
use crate::fp;
use crate::graph::merge_bases;
use crate::head::{Head, advance_head};
use crate::lock::IndexGuard;
use crate::repo::Repository;
use crate::revision::resolve;
use crate::state::{OperationKind, OperationState};

/// Nested virtual bases deeper than this use an empty ancestor.
const MAX_VIRTUAL_DEPTH: usize = 8;

/// When a merge may just move HEAD forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FastForward {
    /// Fast-forward when possible, merge otherwise.
    #[default]
    Allow,
    /// Fail with [`KeelError::FastForwardImpossible`] rather than merge.
    Only,
    /// Always create a merge commit.
    Never,
}

/// Options for [`Repository::merge`].
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    pub fast_forward: FastForward,
    /// Message for the merge commit; defaults to `Merge branch '<name>'`.
    pub message: Option<String>,
    pub cancel: Option<CancelToken>,
}

impl Repository {
    /// Merge `rev` into HEAD.
    ///
    /// # Errors
    /// - [`KeelError::OperationInProgress`] or
    ///   [`KeelError::UnmergedPathsConflict`] if a previous operation is
    ///   unfinished
    /// - [`KeelError::CheckoutConflict`] if the index differs from HEAD or
    ///   local changes would be overwritten (nothing is written)
    /// - [`KeelError::FastForwardImpossible`] with [`FastForward::Only`]
    /// - [`KeelError::MissingIdentity`] if a merge commit is needed and no
    ///   identity is configured
    #[instrument(skip_all, fields(rev = %rev))]
    pub fn merge(&self, rev: &str, opts: &MergeOptions) -> KeelResult<OperationOutcome> {
        self.require_worktree("merge")?;
        let guard = self.lock_index()?;
        self.ensure_no_operation()?;
        let conflicts = guard.index().conflicts();
        if !conflicts.is_empty() {
            return Err(KeelError::UnmergedPathsConflict { paths: conflicts });
        }

        let head = self.head()?;
        let theirs_rev = resolve(self.objects(), self.refs(), rev)?;
        let theirs = theirs_rev.commit;
        let head_flat = self.flat_of(head.commit())?;

        let Some(ours) = head.commit() else {
            return self.fast_forward(guard, &head, &head_flat, theirs, rev, opts);
        };
        if ours == theirs {
            return Ok(OperationOutcome::UpToDate);
        }
        let bases = merge_bases(self.objects(), &[ours, theirs])?;
        debug!(bases = bases.len(), "merge bases found");
        if bases.contains(&theirs) {
            info!("already up to date");
            return Ok(OperationOutcome::UpToDate);
        }
        if bases.contains(&ours) && opts.fast_forward != FastForward::Never {
            return self.fast_forward(guard, &head, &head_flat, theirs, rev, opts);
        }
        if opts.fast_forward == FastForward::Only {
            return Err(KeelError::FastForwardImpossible {
                revision: rev.to_owned(),
            });
        }

        require_index_at_head(guard.index(), &head_flat)?;

        let ancestor = ancestor_tree(self.objects(), &bases, 0)?;
        let theirs_flat = flatten_commit(self.objects(), theirs)?;
        let theirs_label = theirs_rev
            .branch
            .as_ref()
            .and_then(|b| b.branch_name())
            .map_or_else(|| theirs.short(), str::to_owned);
        let outcome = merge_trees(
            self.objects(),
            &ancestor,
            &head_flat,
            &theirs_flat,
            &TreeMergeOptions {
                markers: self.marker_style("HEAD", &theirs_label),
                virtual_ancestor: false,
            },
        )?;

        let message = opts.message.clone().unwrap_or_else(|| match &theirs_rev.branch {
            Some(name) => format!("Merge branch '{}'", name.branch_name().unwrap_or(name.as_str())),
            None => format!("Merge commit '{rev}'"),
        });

        if outcome.is_clean() {
            let committer = self.identity()?;
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
            let recorded = self.record_merge(
                &head,
                &outcome.merged,
                vec![ours, theirs],
                &committer,
                message,
                rev,
            );
            let commit = match recorded {
                Ok(commit) => commit,
                Err(err) => {
                    self.roll_back(guard, Some(ours), &err);
                    return Err(err);
                }
            };
            guard.commit()?;
            info!(commit = %commit, "merged");
            return Ok(OperationOutcome::NonFastForward { commit });
        }

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
        let mut state = OperationState::new(OperationKind::Merge, Some(ours), theirs, message);
        state.conflicts = outcome.conflicts.iter().map(|c| c.path.clone()).collect();
        if let Err(err) = state.write_atomic(&self.state_path()) {
            self.roll_back(guard, Some(ours), &err);
            return Err(err);
        }
        guard.commit()?;
        warn!(conflicts = state.conflicts.len(), "merge stopped on conflicts");
        Ok(OperationOutcome::Conflicts(conflicted_paths(&outcome)))
    }

    fn fast_forward(
        &self,
        guard: IndexGuard,
        head: &Head,
        head_flat: &FlatTree,
        target: ObjectId,
        rev: &str,
        opts: &MergeOptions,
    ) -> KeelResult<OperationOutcome> {
        let target_tree = target_from_flat(&flatten_commit(self.objects(), target)?);
        let guard = self.materialize(
            guard,
            &Materialize {
                mode: PlanMode::Switch,
                head: head_flat,
                target: &target_tree,
                force: false,
            },
            opts.cancel.as_ref(),
        )?;
        let moved = fp!("FP_MERGE_BEFORE_REF_UPDATE").and_then(|()| {
            advance_head(
                self.refs(),
                head,
                target,
                &self.reflog_signature(),
                &format!("merge {rev}: Fast-forward"),
            )
        });
        if let Err(err) = moved {
            self.roll_back(guard, head.commit(), &err);
            return Err(err);
        }
        guard.commit()?;
        info!(commit = %target, "fast-forwarded");
        Ok(OperationOutcome::FastForward { commit: target })
    }

    /// Write the merge commit and move HEAD to it.
    fn record_merge(
        &self,
        head: &Head,
        merged: &FlatTree,
        parents: Vec<ObjectId>,
        committer: &Signature,
        message: String,
        rev: &str,
    ) -> KeelResult<ObjectId> {
        let tree = build_tree(self.objects(), merged)?;
        let commit = self.objects().write_commit(Commit {
            tree,
            parents,
            author: committer.clone(),
            committer: committer.clone(),
            message,
        })?;
        fp!("FP_MERGE_BEFORE_REF_UPDATE")?;
        advance_head(
            self.refs(),
            head,
            commit,
            committer,
            &format!("merge {rev}: Merge made by the 'recursive' strategy."),
        )?;
        Ok(commit)
    }
}

/// The tree to use as merge ancestor for `bases`.
fn ancestor_tree(
    store: &dyn ObjectStore,
    bases: &[ObjectId],
    depth: usize,
) -> KeelResult<FlatTree> {
    match bases {
        [] => Ok(FlatTree::new()),
        [only] => Ok(flatten_commit(store, *only)?),
        [first, rest @ ..] => {
            let mut acc = *first;
            for next in rest {
                acc = virtual_merge(store, acc, *next, depth)?;
            }
            Ok(flatten_commit(store, acc)?)
        }
    }
}

/// Merge two bases into an unreferenced commit. Conflicts are resolved in
/// place so the result is always a complete tree.
fn virtual_merge(
    store: &dyn ObjectStore,
    a: ObjectId,
    b: ObjectId,
    depth: usize,
) -> KeelResult<ObjectId> {
    let ancestor = if depth >= MAX_VIRTUAL_DEPTH {
        FlatTree::new()
    } else {
        let bases = merge_bases(store, &[a, b])?;
        ancestor_tree(store, &bases, depth + 1)?
    };
    let outcome = merge_trees(
        store,
        &ancestor,
        &flatten_commit(store, a)?,
        &flatten_commit(store, b)?,
        &TreeMergeOptions {
            markers: MarkerStyle {
                ours_label: "Temporary merge branch 1".to_owned(),
                theirs_label: "Temporary merge branch 2".to_owned(),
                ..MarkerStyle::default()
            },
            virtual_ancestor: true,
        },
    )?;
    let tree = build_tree(store, &outcome.merged)?;
    let sig = Signature::new("keel", "keel@localhost", Timestamp::new(0, 0));
    let commit = store.write_commit(Commit {
        tree,
        parents: vec![a, b],
        author: sig.clone(),
        committer: sig,
        message: "virtual merge base".to_owned(),
    })?;
    debug!(commit = %commit, depth, "virtual merge base built");
    Ok(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::CheckoutOptions;
    use crate::index::Stage;
    use crate::ops::testing::{commit_all, read, repo, write};
    use crate::state::RepoState;
    use keel_core::merge::ConflictReason;

    #[test]
    fn fast_forward_moves_branch_without_commit() {
        let (_dir, repo) = repo();
        write(&repo, "a", "1\n");
        commit_all(&repo, "one");
        repo.create_branch("topic", None).unwrap();
        repo.checkout("topic", &CheckoutOptions::default()).unwrap();
        write(&repo, "b", "2\n");
        let tip = commit_all(&repo, "two");
        repo.checkout("main", &CheckoutOptions::default()).unwrap();

        let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
        assert_eq!(outcome, OperationOutcome::FastForward { commit: tip });
        assert_eq!(repo.head().unwrap().commit(), Some(tip));
        assert_eq!(read(&repo, "b"), "2\n");

        assert_eq!(
            repo.merge("topic", &MergeOptions::default()).unwrap(),
            OperationOutcome::UpToDate
        );
    }

    #[test]
    fn disjoint_changes_merge_cleanly() {
        let (_dir, repo) = repo();
        write(&repo, "a", "1\n");
        write(&repo, "b", "1\n");
        let base = commit_all(&repo, "base");
        repo.create_branch("topic", None).unwrap();
        write(&repo, "a", "ours\n");
        let ours = commit_all(&repo, "ours");
        repo.checkout("topic", &CheckoutOptions::default()).unwrap();
        write(&repo, "b", "theirs\n");
        let theirs = commit_all(&repo, "theirs");
        repo.checkout("main", &CheckoutOptions::default()).unwrap();

        let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
        let OperationOutcome::NonFastForward { commit } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        let c = repo.objects().read_commit(commit).unwrap();
        assert_eq!(c.parents, vec![ours, theirs]);
        assert_eq!(c.message, "Merge branch 'topic'");
        assert_ne!(c.parents[0], base);
        assert_eq!(read(&repo, "a"), "ours\n");
        assert_eq!(read(&repo, "b"), "theirs\n");
        assert_eq!(repo.state().unwrap(), RepoState::Clean);
    }

    #[test]
    fn conflict_records_stages_and_state() {
        let (_dir, repo) = repo();
        write(&repo, "f", "base\n");
        commit_all(&repo, "base");
        repo.create_branch("topic", None).unwrap();
        write(&repo, "f", "ours\n");
        let ours = commit_all(&repo, "ours");
        repo.checkout("topic", &CheckoutOptions::default()).unwrap();
        write(&repo, "f", "theirs\n");
        commit_all(&repo, "theirs");
        repo.checkout("main", &CheckoutOptions::default()).unwrap();

        let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
        let OperationOutcome::Conflicts(paths) = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].reason, ConflictReason::Content);
        assert_eq!(repo.head().unwrap().commit(), Some(ours));

        let index = repo.index().unwrap();
        let stages: Vec<Stage> = index.get("f").unwrap().stages().iter().map(|(s, _)| *s).collect();
        assert_eq!(stages, vec![Stage::Ancestor, Stage::Ours, Stage::Theirs]);
        let marked = read(&repo, "f");
        assert!(marked.contains("<<<<<<< HEAD"), "{marked}");
        assert!(marked.contains(">>>>>>> topic"), "{marked}");
        assert_eq!(
            repo.state().unwrap(),
            RepoState::InProgress {
                kind: OperationKind::Merge,
                unresolved: vec!["f".to_owned()]
            }
        );

        // Resolve and conclude.
        write(&repo, "f", "resolved\n");
        repo.mark_resolved("f").unwrap();
        let merge = repo.commit(&crate::ops::CommitOptions::default()).unwrap();
        let c = repo.objects().read_commit(merge).unwrap();
        assert_eq!(c.parents.len(), 2);
        assert_eq!(c.message, "Merge branch 'topic'");
        assert_eq!(repo.state().unwrap(), RepoState::Clean);
    }

    #[test]
    fn fast_forward_only_refuses_divergence() {
        let (_dir, repo) = repo();
        write(&repo, "a", "1\n");
        commit_all(&repo, "base");
        repo.create_branch("topic", None).unwrap();
        write(&repo, "a", "2\n");
        commit_all(&repo, "ours");
        repo.checkout("topic", &CheckoutOptions::default()).unwrap();
        write(&repo, "b", "x\n");
        commit_all(&repo, "theirs");
        repo.checkout("main", &CheckoutOptions::default()).unwrap();

        let err = repo
            .merge(
                "topic",
                &MergeOptions {
                    fast_forward: FastForward::Only,
                    ..MergeOptions::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, KeelError::FastForwardImpossible { .. }), "{err}");
    }

    #[test]
    fn merge_refuses_while_operation_in_progress() {
        let (_dir, repo) = repo();
        write(&repo, "f", "base\n");
        commit_all(&repo, "base");
        repo.create_branch("topic", None).unwrap();
        write(&repo, "f", "ours\n");
        commit_all(&repo, "ours");
        repo.checkout("topic", &CheckoutOptions::default()).unwrap();
        write(&repo, "f", "theirs\n");
        commit_all(&repo, "theirs");
        repo.checkout("main", &CheckoutOptions::default()).unwrap();
        repo.merge("topic", &MergeOptions::default()).unwrap();

        let err = repo.merge("topic", &MergeOptions::default()).unwrap_err();
        assert!(matches!(err, KeelError::OperationInProgress { .. }), "{err}");

        repo.abort_operation().unwrap();
        assert_eq!(read(&repo, "f"), "ours\n");
        assert_eq!(repo.state().unwrap(), RepoState::Clean);
    }
}
