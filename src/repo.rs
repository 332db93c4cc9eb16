//! The [`Repository`] handle: the three stores plus the metadata directory.
//!
//! Construct via [`Repository::init`], [`Repository::open`] or, for tests
//! and embedders with their own backends, [`Repository::from_parts`]. The
//! operations themselves live in [`crate::ops`] as further `impl` blocks.

use std::fs;
use std::path::{Path, PathBuf};

use keel_core::merge::MarkerStyle;
use keel_core::{FlatTree, flatten_commit};
use keel_store::{
    FsObjectStore, FsRefStore, FsWorkTree, ObjectId, ObjectStore, RefName, RefStore, RefTarget,
    Signature, WorkTree,
};
use tracing::{debug, info, instrument, warn};

use crate::checkout::{self, CancelToken, Materialize, PlanMode};
use crate::config::{Identity, KeelConfig};
use crate::error::{KeelError, KeelResult};
use crate::head::Head;
use crate::ignore::{IgnoreRules, NoIgnore};
use crate::index::{Index, Slot};
use crate::lock::{self, IndexGuard};
use crate::state::{OperationState, RepoState};

/// Name of the metadata directory inside a non-bare repository.
pub const META_DIR: &str = ".keel";

/// Name used in reflog entries when no identity is configured.
const FALLBACK_NAME: &str = "keel";
const FALLBACK_EMAIL: &str = "keel@localhost";

/// An open repository.
pub struct Repository {
    objects: Box<dyn ObjectStore>,
    refs: Box<dyn RefStore>,
    worktree: Option<Box<dyn WorkTree>>,
    meta_dir: PathBuf,
    config: KeelConfig,
    identity: Option<Identity>,
    ignore: Box<dyn IgnoreRules>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("meta_dir", &self.meta_dir)
            .field("bare", &self.is_bare())
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Create a repository with a working tree at `root`; metadata goes in
    /// `root/.keel`.
    ///
    /// # Errors
    /// Returns [`KeelError::AlreadyInitialized`] if `root/.keel` exists.
    pub fn init(root: &Path) -> KeelResult<Self> {
        Self::init_with_config(root, KeelConfig::default())
    }

    /// [`init`](Self::init), writing `config` to `config.toml` first.
    ///
    /// # Errors
    /// As [`init`](Self::init), plus config serialization errors.
    pub fn init_with_config(root: &Path, config: KeelConfig) -> KeelResult<Self> {
        let meta_dir = root.join(META_DIR);
        create_layout(&meta_dir, &config)?;
        info!(root = %root.display(), "initialized repository");
        Ok(Self::fs_backed(Some(root), meta_dir, config))
    }

    /// Create a bare repository (no working tree) in `dir`.
    ///
    /// # Errors
    /// Returns [`KeelError::AlreadyInitialized`] if `dir` already holds one.
    pub fn init_bare(dir: &Path) -> KeelResult<Self> {
        let config = KeelConfig::default();
        create_layout(dir, &config)?;
        info!(dir = %dir.display(), "initialized bare repository");
        Ok(Self::fs_backed(None, dir.to_owned(), config))
    }

    /// Open the repository at `path`: a directory containing `.keel`, or a
    /// bare repository directory.
    ///
    /// # Errors
    /// Returns [`KeelError::NotARepository`] if neither layout is found, or
    /// a config error if `config.toml` is invalid.
    pub fn open(path: &Path) -> KeelResult<Self> {
        let nested = path.join(META_DIR);
        let (root, meta_dir) = if nested.join("HEAD").is_file() {
            (Some(path), nested)
        } else if path.join("HEAD").is_file() && path.join("objects").is_dir() {
            (None, path.to_owned())
        } else {
            return Err(KeelError::NotARepository {
                path: path.to_owned(),
            });
        };
        let config = KeelConfig::load(&meta_dir.join("config.toml"))?;
        debug!(meta = %meta_dir.display(), bare = root.is_none(), "opened repository");
        Ok(Self::fs_backed(root, meta_dir, config))
    }

    fn fs_backed(root: Option<&Path>, meta_dir: PathBuf, config: KeelConfig) -> Self {
        let worktree = root.map(|r| Box::new(FsWorkTree::new(r, META_DIR)) as Box<dyn WorkTree>);
        Self::from_parts(
            Box::new(FsObjectStore::new(&meta_dir.join("objects"))),
            Box::new(FsRefStore::new(&meta_dir)),
            worktree,
            meta_dir,
        )
        .with_config(config)
    }

    /// Assemble a repository from arbitrary backends. `meta_dir` holds the
    /// index, lock files and operation state and must exist.
    #[must_use]
    pub fn from_parts(
        objects: Box<dyn ObjectStore>,
        refs: Box<dyn RefStore>,
        worktree: Option<Box<dyn WorkTree>>,
        meta_dir: PathBuf,
    ) -> Self {
        Self {
            objects,
            refs,
            worktree,
            meta_dir,
            config: KeelConfig::default(),
            identity: None,
            ignore: Box::new(NoIgnore),
        }
    }

    /// Use `identity` for commits instead of the configured `[user]`.
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn with_ignore_rules(mut self, rules: Box<dyn IgnoreRules>) -> Self {
        self.ignore = rules;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: KeelConfig) -> Self {
        self.config = config;
        self
    }

    // === Accessors ===

    #[must_use]
    pub fn objects(&self) -> &dyn ObjectStore {
        self.objects.as_ref()
    }

    #[must_use]
    pub fn refs(&self) -> &dyn RefStore {
        self.refs.as_ref()
    }

    #[must_use]
    pub fn worktree(&self) -> Option<&dyn WorkTree> {
        self.worktree.as_deref()
    }

    #[must_use]
    pub const fn is_bare(&self) -> bool {
        self.worktree.is_none()
    }

    #[must_use]
    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    #[must_use]
    pub const fn config(&self) -> &KeelConfig {
        &self.config
    }

    pub(crate) fn ignore(&self) -> &dyn IgnoreRules {
        self.ignore.as_ref()
    }

    /// The working tree, or [`KeelError::InvalidOperationOnBareRepository`].
    pub(crate) fn require_worktree(&self, operation: &'static str) -> KeelResult<&dyn WorkTree> {
        self.worktree()
            .ok_or(KeelError::InvalidOperationOnBareRepository { operation })
    }

    pub(crate) fn index_path(&self) -> PathBuf {
        self.meta_dir.join("index.json")
    }

    pub(crate) fn state_path(&self) -> PathBuf {
        OperationState::default_path(&self.meta_dir)
    }

    /// # Errors
    /// Returns a state error if HEAD is missing or malformed.
    pub fn head(&self) -> KeelResult<Head> {
        Head::read(self.refs())
    }

    /// The index as last committed. Takes no lock.
    ///
    /// # Errors
    /// Returns a state error if the index file is unreadable.
    pub fn index(&self) -> KeelResult<Index> {
        Index::load(&self.index_path())
    }

    /// The recorded in-progress operation, if any.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if the record is unreadable.
    pub fn operation_state(&self) -> KeelResult<Option<OperationState>> {
        OperationState::read(&self.state_path())
    }

    /// Whether an operation is pending and which paths are unresolved.
    ///
    /// # Errors
    /// Returns a state error if the index or the operation record is
    /// unreadable.
    pub fn state(&self) -> KeelResult<RepoState> {
        let unresolved = self.index()?.conflicts();
        Ok(match self.operation_state()? {
            Some(op) => RepoState::InProgress {
                kind: op.kind,
                unresolved,
            },
            None if unresolved.is_empty() => RepoState::Clean,
            None => RepoState::Conflicted { paths: unresolved },
        })
    }

    /// `*.lock` files left in the metadata directory, typically by a crash.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be listed.
    pub fn stale_locks(&self) -> KeelResult<Vec<PathBuf>> {
        lock::stale_locks(&self.meta_dir)
    }

    // === Helpers shared by the operations ===

    pub(crate) fn lock_index(&self) -> KeelResult<IndexGuard> {
        IndexGuard::acquire(&self.index_path(), self.config.core.lock_timeout())
    }

    /// Signature for new commits.
    pub(crate) fn identity(&self) -> KeelResult<Signature> {
        self.identity
            .as_ref()
            .or(self.config.user.as_ref())
            .map(Identity::signature)
            .ok_or(KeelError::MissingIdentity)
    }

    /// Signature for reflog entries, which never fail for want of one.
    pub(crate) fn reflog_signature(&self) -> Signature {
        self.identity()
            .unwrap_or_else(|_| Signature::now(FALLBACK_NAME, FALLBACK_EMAIL))
    }

    pub(crate) fn marker_style(&self, ours_label: &str, theirs_label: &str) -> MarkerStyle {
        MarkerStyle {
            style: self.config.merge.conflict_style,
            size: self.config.merge.marker_size,
            ours_label: ours_label.to_owned(),
            base_label: "merged common ancestors".to_owned(),
            theirs_label: theirs_label.to_owned(),
        }
    }

    /// The flattened tree of `commit`, empty for `None`.
    pub(crate) fn flat_of(&self, commit: Option<ObjectId>) -> KeelResult<FlatTree> {
        match commit {
            Some(oid) => Ok(flatten_commit(self.objects(), oid)?),
            None => Ok(FlatTree::new()),
        }
    }

    /// Fail with [`KeelError::OperationInProgress`] if one is recorded.
    pub(crate) fn ensure_no_operation(&self) -> KeelResult<()> {
        match self.operation_state()? {
            Some(op) => Err(KeelError::OperationInProgress { kind: op.kind }),
            None => Ok(()),
        }
    }

    /// Plan `request` and, if nothing blocks, apply it through `guard`.
    ///
    /// # Errors
    /// [`KeelError::CheckoutConflict`] with every blocking path (nothing is
    /// written), or whatever [`checkout::apply`] returns.
    #[instrument(skip_all, fields(mode = ?request.mode, force = request.force))]
    pub(crate) fn materialize(
        &self,
        guard: IndexGuard,
        request: &Materialize<'_>,
        cancel: Option<&CancelToken>,
    ) -> KeelResult<IndexGuard> {
        let Some(worktree) = self.worktree() else {
            let mut guard = guard;
            stage_only(guard.index_mut(), request);
            return Ok(guard);
        };
        let plan = checkout::plan(worktree, guard.index(), request)?;
        if !plan.blocking.is_empty() {
            let mut paths = plan.blocking;
            paths.sort();
            warn!(blocking = paths.len(), "local changes would be overwritten");
            return Err(KeelError::CheckoutConflict { paths });
        }
        checkout::apply(self.objects(), worktree, guard, &plan, cancel)
    }
}

/// Bare repositories: move the index to the target with no files involved.
fn stage_only(index: &mut Index, request: &Materialize<'_>) {
    if request.mode == PlanMode::Switch {
        let gone: Vec<String> = index
            .paths()
            .filter(|p| !request.target.contains_key(*p))
            .map(str::to_owned)
            .collect();
        for path in gone {
            index.remove(&path);
        }
    }
    for (path, entry) in request.target {
        match entry.slot {
            Slot::Resolved(blob) => index.set_resolved(path, blob.with_stat(None)),
            Slot::Conflicted {
                ancestor,
                ours,
                theirs,
            } => index.set_conflicted(path, ancestor, ours, theirs),
        }
    }
}

/// Create the metadata layout in `meta_dir` with HEAD on the default branch.
fn create_layout(meta_dir: &Path, config: &KeelConfig) -> KeelResult<()> {
    if meta_dir.join("HEAD").exists() {
        return Err(KeelError::AlreadyInitialized {
            path: meta_dir.to_owned(),
        });
    }
    fs::create_dir_all(meta_dir.join("objects"))?;
    fs::create_dir_all(meta_dir.join("refs").join("heads"))?;
    if *config != KeelConfig::default() {
        fs::write(meta_dir.join("config.toml"), config.to_toml()?)?;
    }
    let refs = FsRefStore::new(meta_dir);
    let branch = RefName::branch(&config.core.default_branch)?;
    refs.compare_and_set(&RefName::head(), None, &RefTarget::Symbolic(branch))?;
    Ok(())
}
