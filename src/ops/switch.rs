//! Switching HEAD to another commit, and restoring individual paths.

use keel_core::{FlatTree, flatten_commit};
use tracing::{info, instrument};

use crate::checkout::{
    CancelToken, CheckoutOptions, Materialize, PlanMode, Target, TargetEntry, target_from_flat,
};
use crate::error::{KeelError, KeelResult};
use crate::head::{Head, HeadTarget, switch_head};
use crate::pathspec::Pathspec;
use crate::repo::Repository;
use crate::revision::{resolve, resolve_commit};
use crate::state::OperationState;

/// Where [`Repository::checkout_paths`] takes content from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSource {
    /// The staged content: discard unstaged edits.
    Index,
    /// A commit's tree; the index is updated too.
    Revision(String),
}

impl Default for PathSource {
    fn default() -> Self {
        Self::Revision("HEAD".to_owned())
    }
}

/// Options for [`Repository::checkout_paths`].
#[derive(Clone, Debug, Default)]
pub struct CheckoutPathsOptions {
    pub force: bool,
    /// Treat patterns as exact paths; unmatched ones are skipped silently.
    pub literal: bool,
    pub cancel: Option<CancelToken>,
}

impl Repository {
    /// Check out `rev`: update the index and working tree to its tree and
    /// point HEAD at it, attached when `rev` names a branch.
    ///
    /// Local changes to paths the switch leaves alone are carried over.
    ///
    /// # Errors
    /// - [`KeelError::CheckoutConflict`] listing every path whose local
    ///   changes would be lost (nothing is written)
    /// - [`KeelError::UnmergedPathsConflict`] or
    ///   [`KeelError::OperationInProgress`] unless forced
    /// - [`KeelError::Cancelled`] if the token fires part-way
    #[instrument(skip_all, fields(rev = %rev, force = opts.force))]
    pub fn checkout(&self, rev: &str, opts: &CheckoutOptions) -> KeelResult<Head> {
        self.require_worktree("checkout")?;
        let guard = self.lock_index()?;
        let op = self.operation_state()?;
        if !opts.force {
            if let Some(op) = &op {
                return Err(KeelError::OperationInProgress { kind: op.kind });
            }
            let conflicts = guard.index().conflicts();
            if !conflicts.is_empty() {
                return Err(KeelError::UnmergedPathsConflict { paths: conflicts });
            }
        }

        let head = self.head()?;
        let target_rev = resolve(self.objects(), self.refs(), rev)?;
        let head_flat = self.flat_of(head.commit())?;
        let target = target_from_flat(&flatten_commit(self.objects(), target_rev.commit)?);
        let guard = self.materialize(
            guard,
            &Materialize {
                mode: PlanMode::Switch,
                head: &head_flat,
                target: &target,
                force: opts.force,
            },
            opts.cancel.as_ref(),
        )?;

        let to = match target_rev.branch {
            Some(name) => HeadTarget::Branch {
                name,
                commit: target_rev.commit,
            },
            None => HeadTarget::Detached(target_rev.commit),
        };
        let from = match &head {
            Head::Branch { name, .. } => name.branch_name().unwrap_or(name.as_str()).to_owned(),
            Head::Detached { target } => target.short(),
        };
        switch_head(
            self.refs(),
            &head,
            &to,
            &self.reflog_signature(),
            &format!("checkout: moving from {from} to {rev}"),
        )?;
        if op.is_some() {
            OperationState::remove(&self.state_path())?;
        }
        guard.commit()?;

        let head = self.head()?;
        info!(%head, "checked out");
        Ok(head)
    }

    /// Overwrite the paths selected by `patterns` with their content in
    /// `source`. HEAD never moves and paths missing from the source are
    /// left alone. Returns the selected paths.
    ///
    /// # Errors
    /// - [`KeelError::UnmatchedPathspec`] for glob patterns matching nothing
    /// - [`KeelError::UnmergedPathsConflict`] when restoring conflicted
    ///   paths from the index
    /// - [`KeelError::CheckoutConflict`] for local changes, unless forced
    #[instrument(skip_all, fields(source = ?source, patterns = patterns.len()))]
    pub fn checkout_paths<S: AsRef<str>>(
        &self,
        source: &PathSource,
        patterns: &[S],
        opts: &CheckoutPathsOptions,
    ) -> KeelResult<Vec<String>> {
        self.require_worktree("checkout_paths")?;
        let spec = Pathspec::new(patterns, opts.literal)?;
        let guard = self.lock_index()?;

        let available: Target = match source {
            PathSource::Index => guard
                .index()
                .slots()
                .map(|(path, slot)| {
                    let file = slot.resolved().map(|b| b.flat());
                    (path.to_owned(), TargetEntry { slot: *slot, file })
                })
                .collect(),
            PathSource::Revision(rev) => {
                let commit = resolve_commit(self.objects(), self.refs(), rev)?;
                target_from_flat(&flatten_commit(self.objects(), commit)?)
            }
        };

        let (selected, unmatched) = spec.select(available.keys().map(String::as_str));
        if !opts.literal && !unmatched.is_empty() {
            return Err(KeelError::UnmatchedPathspec {
                patterns: unmatched,
            });
        }
        let unmerged: Vec<String> = selected
            .iter()
            .filter(|p| available.get(**p).is_some_and(|t| t.slot.is_conflicted()))
            .map(|p| (*p).to_owned())
            .collect();
        if !unmerged.is_empty() {
            return Err(KeelError::UnmergedPathsConflict { paths: unmerged });
        }
        let target: Target = selected
            .iter()
            .filter_map(|p| available.get(*p).map(|t| ((*p).to_owned(), *t)))
            .collect();
        let restored: Vec<String> = target.keys().cloned().collect();

        let guard = self.materialize(
            guard,
            &Materialize {
                mode: PlanMode::Paths,
                head: &FlatTree::new(),
                target: &target,
                force: opts.force,
            },
            opts.cancel.as_ref(),
        )?;
        guard.commit()?;
        info!(paths = restored.len(), "paths restored");
        Ok(restored)
    }
}
