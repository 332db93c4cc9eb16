//! Recording the index as a new commit.

use keel_store::{Commit, ObjectId, Signature};
use tracing::{info, instrument};

use crate::error::{KeelError, KeelResult};
use crate::fp;
use crate::head::advance_head;
use crate::repo::Repository;
use crate::state::{OperationKind, OperationState};

/// Options for [`Repository::commit`].
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    /// Commit message. When empty and an operation is being concluded, the
    /// message it recorded is used.
    pub message: String,
    /// Defaults to the committer, or to the original author when concluding
    /// a cherry-pick.
    pub author: Option<Signature>,
    /// Defaults to the repository identity.
    pub committer: Option<Signature>,
    /// Allow a commit whose tree equals its parent's. `commit.allow_empty`
    /// in the config has the same effect.
    pub allow_empty: bool,
}

impl CommitOptions {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl Repository {
    /// Record the index as a commit on top of HEAD and advance HEAD to it.
    ///
    /// Concluding a merge adds the merged commit as second parent;
    /// concluding a cherry-pick keeps the picked commit's author. Either way
    /// the operation record is cleared.
    ///
    /// # Errors
    /// - [`KeelError::UnmergedPathsConflict`] if the index has conflicts
    /// - [`KeelError::EmptyCommitRejected`] if nothing changed
    /// - [`KeelError::MissingIdentity`] with no committer available
    /// - [`KeelError::LockContention`] if the index lock is held or HEAD
    ///   moved concurrently
    #[instrument(skip_all)]
    pub fn commit(&self, opts: &CommitOptions) -> KeelResult<ObjectId> {
        let guard = self.lock_index()?;
        let conflicts = guard.index().conflicts();
        if !conflicts.is_empty() {
            return Err(KeelError::UnmergedPathsConflict { paths: conflicts });
        }
        let head = self.head()?;
        let op = self.operation_state()?;
        let tree = guard.index().write_tree(self.objects())?;

        let mut parents: Vec<ObjectId> = head.commit().into_iter().collect();
        let concluding_merge = op.as_ref().is_some_and(|o| o.kind == OperationKind::Merge);
        if let Some(o) = op.as_ref().filter(|_| concluding_merge) {
            parents.push(o.other);
        }

        let allow_empty = opts.allow_empty || self.config().commit.allow_empty || concluding_merge;
        if !allow_empty {
            let unchanged = match head.commit() {
                Some(parent) => self.objects().read_commit(parent)?.tree == tree,
                None => guard.index().is_empty(),
            };
            if unchanged {
                return Err(KeelError::EmptyCommitRejected);
            }
        }

        let committer = match &opts.committer {
            Some(sig) => sig.clone(),
            None => self.identity()?,
        };
        let author = op
            .as_ref()
            .and_then(|o| o.author.clone())
            .or_else(|| opts.author.clone())
            .unwrap_or_else(|| committer.clone());
        let message = match &op {
            Some(o) if opts.message.trim().is_empty() => o.message.clone(),
            _ => opts.message.clone(),
        };

        let commit = Commit {
            tree,
            parents,
            author,
            committer: committer.clone(),
            message,
        };
        let reflog_kind = match (head.commit(), commit.parents.len()) {
            (None, _) => "commit (initial)",
            (Some(_), n) if n > 1 => "commit (merge)",
            _ => "commit",
        };
        let reflog = format!("{reflog_kind}: {}", commit.summary());
        let oid = self.objects().write_commit(commit)?;

        fp!("FP_COMMIT_BEFORE_REF_UPDATE")?;
        advance_head(self.refs(), &head, oid, &committer, &reflog)?;
        if op.is_some() {
            OperationState::remove(&self.state_path())?;
        }
        drop(guard);
        info!(commit = %oid, "committed");
        Ok(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{commit_all, repo, write};

    #[test]
    fn initial_commit_then_second() {
        let (_dir, repo) = repo();
        write(&repo, "a.txt", "one\n");
        let first = commit_all(&repo, "first");
        let c = repo.objects().read_commit(first).unwrap();
        assert!(c.parents.is_empty());
        assert_eq!(c.author.name, "Test");

        write(&repo, "a.txt", "two\n");
        let second = commit_all(&repo, "second");
        assert_eq!(repo.objects().read_commit(second).unwrap().parents, vec![first]);
        assert_eq!(repo.head().unwrap().commit(), Some(second));

        let log = repo.refs().reflog(repo.head().unwrap().branch().unwrap()).unwrap();
        assert_eq!(log[0].message, "commit (initial): first");
        assert_eq!(log[1].message, "commit: second");
    }

    #[test]
    fn empty_commit_rejected_unless_allowed() {
        let (_dir, repo) = repo();
        assert!(matches!(
            repo.commit(&CommitOptions::new("nothing")),
            Err(KeelError::EmptyCommitRejected)
        ));

        write(&repo, "a", "x");
        let first = commit_all(&repo, "first");
        assert!(matches!(
            repo.commit(&CommitOptions::new("again")),
            Err(KeelError::EmptyCommitRejected)
        ));
        assert_eq!(repo.head().unwrap().commit(), Some(first));

        let empty = repo
            .commit(&CommitOptions {
                allow_empty: true,
                ..CommitOptions::new("empty")
            })
            .unwrap();
        let c = repo.objects().read_commit(empty).unwrap();
        assert_eq!(c.tree, repo.objects().read_commit(first).unwrap().tree);
    }

    #[test]
    fn explicit_author_and_committer() {
        let (_dir, repo) = repo();
        write(&repo, "a", "x");
        repo.stage(&["a"]).unwrap();
        let author = Signature::now("Author", "author@example.com");
        let committer = Signature::now("Committer", "committer@example.com");
        let oid = repo
            .commit(&CommitOptions {
                author: Some(author.clone()),
                committer: Some(committer.clone()),
                ..CommitOptions::new("msg")
            })
            .unwrap();
        let c = repo.objects().read_commit(oid).unwrap();
        assert_eq!(c.author, author);
        assert_eq!(c.committer, committer);
    }

    #[test]
    fn missing_identity_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        write(&repo, "a", "x");
        repo.stage(&["a"]).unwrap();
        assert!(matches!(
            repo.commit(&CommitOptions::new("msg")),
            Err(KeelError::MissingIdentity)
        ));
    }
}
