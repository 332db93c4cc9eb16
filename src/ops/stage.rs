//! Copying working-tree content into the index.

use std::collections::BTreeSet;

use tracing::{debug, instrument};

use crate::error::{KeelError, KeelResult};
use crate::index::{StagedBlob, StatCache};
use crate::pathspec::Pathspec;
use crate::repo::Repository;

impl Repository {
    /// Stage the working-tree state of `paths`: present files are hashed
    /// into the index, missing ones are removed from it. A directory stages
    /// everything below it and `.` stages everything. Staging a conflicted
    /// path resolves it.
    ///
    /// # Errors
    /// [`KeelError::UnmatchedPathspec`] if a path names neither a file nor
    /// an index entry (nothing is staged), or a store error.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub fn stage<S: AsRef<str>>(&self, paths: &[S]) -> KeelResult<()> {
        let worktree = self.require_worktree("stage")?;
        let mut guard = self.lock_index()?;

        let spec = Pathspec::new(paths, true)?;
        let files = worktree.list()?;
        let known: BTreeSet<&str> = files
            .iter()
            .map(String::as_str)
            .chain(guard.index().paths())
            .collect();
        let (selected, unmatched) = spec.select(known);
        if !unmatched.is_empty() {
            return Err(KeelError::UnmatchedPathspec {
                patterns: unmatched,
            });
        }
        let selected: Vec<String> = selected.into_iter().map(str::to_owned).collect();

        let index = guard.index_mut();
        for path in &selected {
            match worktree.stat(path)? {
                Some(stat) => {
                    let content = worktree.read(path)?;
                    let oid = self.objects().write_blob(&content)?;
                    let cache = StatCache::from_stat(&stat);
                    index.set_resolved(path, StagedBlob::new(oid, stat.mode).with_stat(Some(cache)));
                }
                None => {
                    index.remove(path);
                }
            }
        }
        debug!(staged = selected.len(), "paths staged");
        guard.commit()
    }

    /// Mark a conflicted path as resolved with its current working-tree
    /// content.
    ///
    /// # Errors
    /// As [`stage`](Self::stage).
    pub fn mark_resolved(&self, path: &str) -> KeelResult<()> {
        self.stage(&[path])
    }
}
