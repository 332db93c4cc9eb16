//! Synchronizing the index and working tree with a target.
//!
//! Every operation that touches files goes through the same two steps:
//!
//! 1. [`plan::plan`] compares, per path, the HEAD entry, the index slot and
//!    the working-tree file against the target and decides what to do. It
//!    reads the working tree but changes nothing. Paths whose local changes
//!    would be lost are collected as blocking; a non-forced plan with any
//!    blocking path is refused as a whole.
//! 2. [`apply::apply`] carries out the plan one path at a time, removals
//!    first, updating the in-memory index after each step. Cancellation and
//!    I/O errors are checked between paths; on either, the index is
//!    persisted exactly as far as the files went.
//!
//! Checkout of a branch, hard reset, fast-forward and merge materialization
//! all use [`PlanMode::Switch`]. Restoring individual paths uses
//! [`PlanMode::Paths`].

pub mod apply;
pub mod plan;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use keel_core::{FlatEntry, FlatTree};

use crate::index::{Slot, StagedBlob};

pub use apply::apply;
pub use plan::{Change, CheckoutPlan, FileChange, plan};

/// Cooperative cancellation flag, checked between per-path steps.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation holding a clone of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the index and working tree should hold for one path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetEntry {
    pub slot: Slot,
    /// The file to write; `None` leaves no file at the path.
    pub file: Option<FlatEntry>,
}

impl TargetEntry {
    /// A resolved path whose file is exactly the staged blob.
    #[must_use]
    pub fn resolved(entry: FlatEntry) -> Self {
        Self {
            slot: Slot::Resolved(StagedBlob::from(entry)),
            file: Some(entry),
        }
    }

    /// The staged blob, if this target is a plain resolved file.
    #[must_use]
    pub fn resolved_entry(&self) -> Option<FlatEntry> {
        self.slot.resolved().map(StagedBlob::flat)
    }
}

/// Path to target entry. Paths absent from the map are removed (in
/// [`PlanMode::Switch`]) or left alone (in [`PlanMode::Paths`]).
pub type Target = BTreeMap<String, TargetEntry>;

/// A target where every path is resolved to its file.
#[must_use]
pub fn target_from_flat(flat: &FlatTree) -> Target {
    flat.iter()
        .map(|(path, entry)| (path.clone(), TargetEntry::resolved(*entry)))
        .collect()
}

/// How far a plan reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanMode {
    /// Move the whole tree from HEAD to the target. Paths the target leaves
    /// as in HEAD keep their local changes.
    Switch,
    /// Overwrite only the target's paths; nothing is removed and HEAD is
    /// irrelevant.
    Paths,
}

/// One request to the engine.
#[derive(Clone, Copy, Debug)]
pub struct Materialize<'a> {
    pub mode: PlanMode,
    /// The tree of the current HEAD (empty when unborn).
    pub head: &'a FlatTree,
    pub target: &'a Target,
    /// Overwrite local changes instead of refusing.
    pub force: bool,
}

/// Caller-facing knobs for checkout-like operations.
#[derive(Clone, Debug, Default)]
pub struct CheckoutOptions {
    /// Discard local changes that would block the operation.
    pub force: bool,
    pub cancel: Option<CancelToken>,
}
