//! Merge engines: line-level [`text`] merge and per-path [`tree`] merge.

pub mod text;
pub mod tree;

pub use text::{ConflictStyle, MarkerStyle, TextMerge, is_binary, merge_text};
pub use tree::{
    ConflictReason, PathConflict, Side, TreeMergeOptions, TreeMergeOutcome, merge_trees,
};
