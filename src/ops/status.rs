//! Read-only summary of HEAD, index and working tree.

use std::collections::BTreeSet;
use std::fmt;

use tracing::instrument;

use crate::checkout::plan::file_matches;
use crate::error::KeelResult;
use crate::head::Head;
use crate::index::Slot;
use crate::repo::Repository;
use crate::state::RepoState;

/// How a path differs between two sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "A"),
            Self::Modified => write!(f, "M"),
            Self::Deleted => write!(f, "D"),
        }
    }
}

/// Result of [`Repository::status`]. Every list is sorted by path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub head: Head,
    pub state: RepoState,
    /// Index against HEAD.
    pub staged: Vec<(String, ChangeKind)>,
    /// Working tree against index.
    pub unstaged: Vec<(String, ChangeKind)>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl Status {
    /// No staged, unstaged or conflicted changes. Untracked files do not
    /// count.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty() && self.conflicted.is_empty()
    }
}

impl Repository {
    /// Compare HEAD, the index and the working tree. Takes no lock and
    /// writes nothing. Bare repositories report only staged changes.
    ///
    /// # Errors
    /// Returns a store or state error if something cannot be read.
    #[instrument(skip_all)]
    pub fn status(&self) -> KeelResult<Status> {
        let head = self.head()?;
        let index = self.index()?;
        let head_flat = self.flat_of(head.commit())?;
        let conflicted = index.conflicts();

        let mut staged = Vec::new();
        let paths: BTreeSet<&str> = head_flat
            .keys()
            .map(String::as_str)
            .chain(index.paths())
            .collect();
        for path in paths {
            let Some(slot) = index.get(path) else {
                staged.push((path.to_owned(), ChangeKind::Deleted));
                continue;
            };
            let Slot::Resolved(blob) = slot else {
                continue;
            };
            match head_flat.get(path) {
                None => staged.push((path.to_owned(), ChangeKind::Added)),
                Some(entry) if *entry != blob.flat() => {
                    staged.push((path.to_owned(), ChangeKind::Modified));
                }
                Some(_) => {}
            }
        }

        let mut unstaged = Vec::new();
        let mut untracked = Vec::new();
        if let Some(worktree) = self.worktree() {
            for (path, slot) in index.slots() {
                let Slot::Resolved(blob) = slot else {
                    continue;
                };
                let stat = worktree.stat(path)?;
                if stat.is_none() {
                    unstaged.push((path.to_owned(), ChangeKind::Deleted));
                } else if !file_matches(worktree, path, stat.as_ref(), Some(blob.flat()), blob.stat)? {
                    unstaged.push((path.to_owned(), ChangeKind::Modified));
                }
            }
            let mut files = worktree.list()?;
            files.sort();
            untracked = files
                .into_iter()
                .filter(|p| !index.contains(p) && !self.ignore().is_ignored(p))
                .collect();
        }

        Ok(Status {
            head,
            state: self.state()?,
            staged,
            unstaged,
            untracked,
            conflicted,
        })
    }
}
