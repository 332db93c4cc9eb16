//! Helpers shared by the operation unit tests.

use keel_store::{EntryMode, ObjectId, WorkTree};
use tempfile::TempDir;

use crate::config::Identity;
use crate::ops::CommitOptions;
use crate::repo::Repository;

/// A fresh filesystem-backed repository with a test identity.
pub fn repo() -> (TempDir, Repository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(dir.path())
        .unwrap()
        .with_identity(Identity::new("Test", "test@example.com"));
    (dir, repo)
}

pub fn write(repo: &Repository, path: &str, content: &str) {
    wt(repo).write(path, content.as_bytes(), EntryMode::Blob).unwrap();
}

pub fn read(repo: &Repository, path: &str) -> String {
    String::from_utf8(wt(repo).read(path).unwrap()).unwrap()
}

pub fn wt(repo: &Repository) -> &dyn WorkTree {
    repo.worktree().unwrap()
}

/// Stage every file (and every deletion) and commit.
pub fn commit_all(repo: &Repository, message: &str) -> ObjectId {
    let mut paths: Vec<String> = wt(repo).list().unwrap();
    paths.extend(repo.index().unwrap().paths().map(str::to_owned));
    paths.sort();
    paths.dedup();
    repo.stage(&paths).unwrap();
    repo.commit(&CommitOptions::new(message)).unwrap()
}
