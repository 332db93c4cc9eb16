//! Carrying out a [`CheckoutPlan`] one path at a time.

use keel_store::{ObjectStore, WorkTree};
use tracing::{info, instrument, warn};

use super::plan::{CheckoutPlan, FileChange, fresh_stat};
use super::CancelToken;
use crate::error::{KeelError, KeelResult};
use crate::fp;
use crate::index::Slot;
use crate::lock::IndexGuard;

/// Apply `plan` to the working tree and to the index held by `guard`.
///
/// On success the guard comes back with the index updated in memory; the
/// caller moves refs and then commits it. If the token is cancelled or a
/// path fails, the index is written reflecting exactly the paths already
/// applied, the lock is released and the error is returned
/// ([`KeelError::Cancelled`] lists both halves).
///
/// # Errors
/// [`KeelError::Cancelled`], or the first store/I/O error.
#[instrument(skip_all, fields(changes = plan.changes.len()))]
pub fn apply(
    store: &dyn ObjectStore,
    worktree: &dyn WorkTree,
    mut guard: IndexGuard,
    plan: &CheckoutPlan,
    cancel: Option<&CancelToken>,
) -> KeelResult<IndexGuard> {
    let ordered = plan.ordered();
    let mut applied: Vec<String> = Vec::with_capacity(ordered.len());

    for (i, change) in ordered.iter().enumerate() {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            let remaining: Vec<String> = ordered[i..].iter().map(|c| c.path.clone()).collect();
            warn!(
                applied = applied.len(),
                remaining = remaining.len(),
                "checkout cancelled"
            );
            guard.commit()?;
            return Err(KeelError::Cancelled { applied, remaining });
        }
        if let Err(err) = step(store, worktree, &mut guard, change) {
            warn!(path = %change.path, error = %err, applied = applied.len(), "checkout stopped");
            guard.commit()?;
            return Err(err);
        }
        applied.push(change.path.clone());
    }

    info!(paths = applied.len(), "checkout applied");
    Ok(guard)
}

fn step(
    store: &dyn ObjectStore,
    worktree: &dyn WorkTree,
    guard: &mut IndexGuard,
    change: &super::Change,
) -> KeelResult<()> {
    fp!("FP_CHECKOUT_BETWEEN_PATHS")?;
    match change.file {
        FileChange::Keep => {}
        FileChange::Remove => worktree.remove(&change.path)?,
        FileChange::Write(entry) => {
            let content = store.read_blob(entry.oid)?;
            worktree.write(&change.path, &content, entry.mode)?;
        }
    }

    let index = guard.index_mut();
    match change.slot {
        None => {
            index.remove(&change.path);
        }
        Some(Slot::Resolved(blob)) => {
            let on_disk = match change.file {
                FileChange::Write(entry) => Some(entry),
                FileChange::Keep | FileChange::Remove => None,
            };
            let stat = if on_disk == Some(blob.flat()) {
                fresh_stat(worktree, &change.path, &blob)?
            } else {
                None
            };
            index.set_resolved(&change.path, blob.with_stat(stat));
        }
        Some(Slot::Conflicted {
            ancestor,
            ours,
            theirs,
        }) => index.set_conflicted(&change.path, ancestor, ours, theirs),
    }
    Ok(())
}
