//! Removing untracked files.

use tracing::{info, instrument};

use crate::error::KeelResult;
use crate::repo::Repository;

/// Options for [`Repository::remove_untracked_files`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanOptions {
    /// Report what would be removed without removing it.
    pub dry_run: bool,
}

impl Repository {
    /// Delete every working-tree file that the index does not track (at any
    /// stage) and the ignore rules do not cover. Returns the affected paths,
    /// sorted. HEAD and the index are untouched.
    ///
    /// # Errors
    /// [`KeelError::InvalidOperationOnBareRepository`](crate::KeelError::InvalidOperationOnBareRepository)
    /// for a bare repository, or the first I/O error.
    #[instrument(skip_all, fields(dry_run = opts.dry_run))]
    pub fn remove_untracked_files(&self, opts: &CleanOptions) -> KeelResult<Vec<String>> {
        let worktree = self.require_worktree("remove_untracked_files")?;
        let guard = self.lock_index()?;
        let mut untracked: Vec<String> = worktree
            .list()?
            .into_iter()
            .filter(|p| !guard.index().contains(p) && !self.ignore().is_ignored(p))
            .collect();
        untracked.sort();
        if !opts.dry_run {
            for path in &untracked {
                worktree.remove(path)?;
            }
        }
        info!(paths = untracked.len(), "untracked files removed");
        Ok(untracked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore::PatternIgnore;
    use crate::ops::testing::{commit_all, repo, write, wt};

    #[test]
    fn removes_only_untracked_unignored_files() {
        let (_dir, repo) = repo();
        write(&repo, "tracked", "1");
        commit_all(&repo, "one");
        write(&repo, "staged", "2");
        repo.stage(&["staged"]).unwrap();
        write(&repo, "junk/a", "3");
        write(&repo, "debug.log", "4");
        let repo = repo.with_ignore_rules(Box::new(PatternIgnore::new(["*.log"]).unwrap()));

        let preview = repo
            .remove_untracked_files(&CleanOptions { dry_run: true })
            .unwrap();
        assert_eq!(preview, vec!["junk/a"]);
        assert!(wt(&repo).stat("junk/a").unwrap().is_some());

        let removed = repo.remove_untracked_files(&CleanOptions::default()).unwrap();
        assert_eq!(removed, preview);
        let mut left = wt(&repo).list().unwrap();
        left.sort();
        assert_eq!(left, vec!["debug.log", "staged", "tracked"]);
        assert_eq!(repo.index().unwrap().len(), 2);
    }
}
