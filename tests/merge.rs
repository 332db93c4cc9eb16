//! Integration tests: merge, abort and conflict resolution on disk.

mod common;

use common::{commit_all, exists, head_commit, read, setup_repo, write};
use keel::{
    CheckoutOptions, CommitOptions, FastForward, KeelError, MergeOptions, OperationKind,
    OperationOutcome, RepoState, Slot,
};

#[test]
fn fast_forward_moves_branch_and_files() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "a.txt", "one\n");
    commit_all(&repo, "one");
    repo.create_branch("topic", None).unwrap();
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "b.txt", "two\n");
    let tip = commit_all(&repo, "two");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();
    assert!(!exists(dir.path(), "b.txt"));

    let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
    assert_eq!(outcome, OperationOutcome::FastForward { commit: tip });
    assert_eq!(head_commit(&repo), Some(tip));
    assert_eq!(read(dir.path(), "b.txt"), "two\n");
    assert!(repo.status().unwrap().is_clean());

    let again = repo.merge("topic", &MergeOptions::default()).unwrap();
    assert_eq!(again, OperationOutcome::UpToDate);
}

#[test]
fn disjoint_changes_merge_cleanly() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "shared.txt", "base\n");
    let base = commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();

    write(dir.path(), "ours.txt", "ours\n");
    let ours = commit_all(&repo, "ours");

    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "theirs.txt", "theirs\n");
    let theirs = commit_all(&repo, "theirs");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();

    let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
    let OperationOutcome::NonFastForward { commit } = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };
    let merged = repo.objects().read_commit(commit).unwrap();
    assert_eq!(merged.parents, vec![ours, theirs]);
    assert_eq!(merged.message, "Merge branch 'topic'");
    assert_eq!(read(dir.path(), "ours.txt"), "ours\n");
    assert_eq!(read(dir.path(), "theirs.txt"), "theirs\n");
    assert_eq!(read(dir.path(), "shared.txt"), "base\n");
    assert!(repo.status().unwrap().is_clean());
    assert_ne!(commit, base);
}

#[test]
fn conflicting_edit_records_stages_and_resumes() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "f.txt", "line\n");
    let base = commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();
    write(dir.path(), "f.txt", "ours\n");
    let ours = commit_all(&repo, "ours");
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "f.txt", "theirs\n");
    let theirs = commit_all(&repo, "theirs");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();

    let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
    let OperationOutcome::Conflicts(paths) = outcome else {
        panic!("expected conflicts, got {outcome:?}");
    };
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].path, "f.txt");
    assert!(paths[0].ancestor.is_some() && paths[0].ours.is_some() && paths[0].theirs.is_some());

    let index = repo.index().unwrap();
    assert!(matches!(index.get("f.txt"), Some(Slot::Conflicted { .. })));
    let content = read(dir.path(), "f.txt");
    assert!(content.contains("<<<<<<< HEAD"), "{content}");
    assert!(content.contains(">>>>>>> topic"), "{content}");

    // HEAD has not moved and the operation is recorded.
    assert_eq!(head_commit(&repo), Some(ours));
    assert_eq!(
        repo.state().unwrap(),
        RepoState::InProgress {
            kind: OperationKind::Merge,
            unresolved: vec!["f.txt".to_owned()],
        }
    );

    // Committing with unresolved paths is refused.
    assert!(matches!(
        repo.commit(&CommitOptions::new("")),
        Err(KeelError::UnmergedPathsConflict { .. })
    ));

    write(dir.path(), "f.txt", "resolved\n");
    repo.mark_resolved("f.txt").unwrap();
    let merge = repo.commit(&CommitOptions::new("")).unwrap();
    let commit = repo.objects().read_commit(merge).unwrap();
    assert_eq!(commit.parents, vec![ours, theirs]);
    assert_eq!(commit.message, "Merge branch 'topic'");
    assert_eq!(repo.state().unwrap(), RepoState::Clean);
    assert_ne!(merge, base);
}

#[test]
fn abort_restores_pre_merge_tree() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "f.txt", "line\n");
    write(dir.path(), "other.txt", "keep\n");
    commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();
    write(dir.path(), "f.txt", "ours\n");
    let ours = commit_all(&repo, "ours");
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "f.txt", "theirs\n");
    write(dir.path(), "new.txt", "from topic\n");
    commit_all(&repo, "theirs");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();

    let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
    assert!(matches!(outcome, OperationOutcome::Conflicts(_)));
    assert_eq!(read(dir.path(), "new.txt"), "from topic\n");

    // A second merge is refused while one is pending.
    assert!(matches!(
        repo.merge("topic", &MergeOptions::default()),
        Err(KeelError::OperationInProgress { .. } | KeelError::UnmergedPathsConflict { .. })
    ));

    repo.abort_operation().unwrap();
    assert_eq!(head_commit(&repo), Some(ours));
    assert_eq!(read(dir.path(), "f.txt"), "ours\n");
    assert_eq!(read(dir.path(), "other.txt"), "keep\n");
    assert!(!exists(dir.path(), "new.txt"));
    assert_eq!(repo.state().unwrap(), RepoState::Clean);
    assert!(repo.status().unwrap().is_clean());

    assert!(matches!(
        repo.abort_operation(),
        Err(KeelError::NoOperationInProgress)
    ));
}

#[test]
fn ff_only_refuses_divergent_history() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "a", "1\n");
    commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();
    write(dir.path(), "b", "2\n");
    let ours = commit_all(&repo, "ours");
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "c", "3\n");
    commit_all(&repo, "theirs");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();

    let opts = MergeOptions {
        fast_forward: FastForward::Only,
        ..MergeOptions::default()
    };
    assert!(matches!(
        repo.merge("topic", &opts),
        Err(KeelError::FastForwardImpossible { .. })
    ));
    assert_eq!(head_commit(&repo), Some(ours));
    assert!(!exists(dir.path(), "c"));
}

#[test]
fn no_ff_creates_merge_commit() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "a", "1\n");
    let base = commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "b", "2\n");
    let tip = commit_all(&repo, "tip");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();

    let opts = MergeOptions {
        fast_forward: FastForward::Never,
        ..MergeOptions::default()
    };
    let outcome = repo.merge("topic", &opts).unwrap();
    let OperationOutcome::NonFastForward { commit } = outcome else {
        panic!("expected a merge commit, got {outcome:?}");
    };
    assert_eq!(
        repo.objects().read_commit(commit).unwrap().parents,
        vec![base, tip]
    );
    assert_eq!(read(dir.path(), "b"), "2\n");
}

#[test]
fn criss_cross_history_merges_through_virtual_base() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "f", "base\n");
    write(dir.path(), "g", "base\n");
    commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();

    write(dir.path(), "m", "main\n");
    let b1 = commit_all(&repo, "b1");
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "t", "topic\n");
    let c1 = commit_all(&repo, "c1");

    // Each side merges the other's first commit.
    let on_topic = repo.merge(&b1.to_string(), &MergeOptions::default()).unwrap();
    assert!(matches!(on_topic, OperationOutcome::NonFastForward { .. }));
    repo.checkout("main", &CheckoutOptions::default()).unwrap();
    let on_main = repo.merge(&c1.to_string(), &MergeOptions::default()).unwrap();
    assert!(matches!(on_main, OperationOutcome::NonFastForward { .. }));

    write(dir.path(), "f", "main edit\n");
    let main_tip = commit_all(&repo, "main edit");
    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    write(dir.path(), "g", "topic edit\n");
    let topic_tip = commit_all(&repo, "topic edit");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();

    let mut bases = keel::graph::merge_bases(repo.objects(), &[main_tip, topic_tip]).unwrap();
    bases.sort();
    let mut expected = vec![b1, c1];
    expected.sort();
    assert_eq!(bases, expected);

    let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
    assert!(
        matches!(outcome, OperationOutcome::NonFastForward { .. }),
        "{outcome:?}"
    );
    assert_eq!(read(dir.path(), "f"), "main edit\n");
    assert_eq!(read(dir.path(), "g"), "topic edit\n");
    assert_eq!(read(dir.path(), "m"), "main\n");
    assert_eq!(read(dir.path(), "t"), "topic\n");
    assert!(repo.status().unwrap().is_clean());
}

#[test]
fn file_replacing_conflicted_directory_is_recorded() {
    let (dir, repo) = setup_repo();
    write(dir.path(), "x/inner", "1\n");
    write(dir.path(), "keep", "k\n");
    commit_all(&repo, "base");
    repo.create_branch("topic", None).unwrap();
    write(dir.path(), "x/inner", "2\n");
    let ours = commit_all(&repo, "ours");

    repo.checkout("topic", &CheckoutOptions::default()).unwrap();
    std::fs::remove_dir_all(dir.path().join("x")).unwrap();
    write(dir.path(), "x", "file\n");
    commit_all(&repo, "theirs");
    repo.checkout("main", &CheckoutOptions::default()).unwrap();
    assert_eq!(read(dir.path(), "x/inner"), "2\n");

    let outcome = repo.merge("topic", &MergeOptions::default()).unwrap();
    let OperationOutcome::Conflicts(paths) = outcome else {
        panic!("expected conflicts, got {outcome:?}");
    };
    let names: Vec<&str> = paths.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(names, vec!["x", "x/inner"]);

    // The directory stays; the file version lives only in the index.
    assert_eq!(read(dir.path(), "x/inner"), "2\n");
    assert_eq!(read(dir.path(), "keep"), "k\n");
    let index = repo.index().unwrap();
    assert!(matches!(index.get("x"), Some(Slot::Conflicted { .. })));
    assert!(matches!(index.get("x/inner"), Some(Slot::Conflicted { .. })));
    assert_eq!(head_commit(&repo), Some(ours));
    assert!(matches!(
        repo.state().unwrap(),
        RepoState::InProgress {
            kind: OperationKind::Merge,
            ..
        }
    ));

    repo.abort_operation().unwrap();
    assert_eq!(read(dir.path(), "x/inner"), "2\n");
    assert!(repo.status().unwrap().is_clean());
}
