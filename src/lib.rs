//! keel: the mutation core of a version-control engine.
//!
//! A [`Repository`] coordinates three stores (refs, index, working tree)
//! through commit, checkout, reset, merge, cherry-pick, revert and clean,
//! never leaving them inconsistent with each other. Storage backends and
//! value types live in `keel-store`; the pure merge engine lives in
//! `keel-core`. The `keel` binary in `keel-cli` is a thin shell over this
//! crate.

pub mod checkout;
pub mod config;
pub mod error;
pub mod failpoints;
pub mod graph;
pub mod head;
pub mod ignore;
pub mod index;
pub mod lock;
pub mod ops;
pub mod pathspec;
pub mod repo;
pub mod revision;
pub mod state;
pub mod telemetry;

pub use checkout::{CancelToken, CheckoutOptions};
pub use config::{Identity, KeelConfig};
pub use error::{KeelError, KeelResult};
pub use head::Head;
pub use ignore::{IgnoreRules, NoIgnore, PatternIgnore};
pub use index::{Index, Slot, Stage, StagedBlob};
pub use ops::{
    ChangeKind, CheckoutPathsOptions, CleanOptions, CommitOptions, ConflictedPath, FastForward,
    MergeOptions, OperationOutcome, PathSource, ReplayOptions, ResetMode, Status,
};
pub use repo::{META_DIR, Repository};
pub use state::{OperationKind, OperationState, RepoState};

pub use keel_core::merge::ConflictReason;
pub use keel_store::{ObjectId, RefName, Signature};
