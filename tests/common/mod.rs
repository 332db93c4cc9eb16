//! Shared helpers for keel integration tests.
//!
//! Every test gets its own repository in a temp directory.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use keel::{CommitOptions, Identity, ObjectId, Repository, Signature};
use keel_store::Timestamp;
use tempfile::TempDir;

/// A fresh repository with a working tree and a test identity.
pub fn setup_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo = Repository::init(dir.path())
        .expect("init")
        .with_identity(Identity::new("Test", "test@example.com"));
    (dir, repo)
}

/// Fixed signature so commit ids are reproducible.
pub fn fixed_sig() -> Signature {
    Signature::new("Test", "test@example.com", Timestamp::new(1_700_000_000, 0))
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(path, content).expect("write file");
}

pub fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).expect("read file")
}

pub fn exists(root: &Path, rel: &str) -> bool {
    root.join(rel).exists()
}

/// Stage every file in the working tree plus every tracked deletion.
pub fn stage_all(repo: &Repository) {
    let mut paths = repo.worktree().expect("worktree").list().expect("list");
    paths.extend(repo.index().expect("index").paths().map(str::to_owned));
    paths.sort();
    paths.dedup();
    repo.stage(&paths).expect("stage");
}

/// Stage everything and commit with `message`.
pub fn commit_all(repo: &Repository, message: &str) -> ObjectId {
    stage_all(repo);
    repo.commit(&CommitOptions::new(message)).expect("commit")
}

/// Stage everything and commit with a fixed author and committer.
pub fn commit_all_fixed(repo: &Repository, message: &str) -> ObjectId {
    stage_all(repo);
    repo.commit(&CommitOptions {
        author: Some(fixed_sig()),
        committer: Some(fixed_sig()),
        ..CommitOptions::new(message)
    })
    .expect("commit")
}

/// The commit HEAD points at.
pub fn head_commit(repo: &Repository) -> Option<ObjectId> {
    repo.head().expect("head").commit()
}
