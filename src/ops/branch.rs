//! Creating branches.

use keel_store::{RefName, RefTarget, ReflogEntry};
use tracing::{info, instrument};

use crate::error::{KeelError, KeelResult};
use crate::repo::Repository;
use crate::revision::resolve_commit;

impl Repository {
    /// Create `refs/heads/<name>` at `start` (default HEAD). HEAD is not
    /// moved.
    ///
    /// # Errors
    /// - [`KeelError::RefExists`] if the branch already exists
    /// - [`KeelError::InvalidRevision`] if `start` does not resolve (for
    ///   example HEAD is unborn)
    #[instrument(skip_all, fields(name = %name))]
    pub fn create_branch(&self, name: &str, start: Option<&str>) -> KeelResult<RefName> {
        let branch = RefName::branch(name)?;
        if self.refs().read(&branch)?.is_some() {
            return Err(KeelError::RefExists {
                name: branch.to_string(),
            });
        }
        let start_spec = start.unwrap_or("HEAD");
        let commit = resolve_commit(self.objects(), self.refs(), start_spec)?;
        self.refs()
            .compare_and_set(&branch, None, &RefTarget::Direct(commit))?;
        self.refs().append_reflog(
            &branch,
            &ReflogEntry {
                old: None,
                new: commit,
                committer: self.reflog_signature(),
                message: format!("branch: Created from {start_spec}"),
            },
        )?;
        info!(branch = %branch, at = %commit, "branch created");
        Ok(branch)
    }

    /// Every branch with the commit it points at, sorted by name.
    ///
    /// # Errors
    /// Returns a store error if the refs cannot be listed.
    pub fn branches(&self) -> KeelResult<Vec<(RefName, RefTarget)>> {
        let mut branches = self.refs().list("refs/heads/")?;
        branches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(branches)
    }
}
