//! Pure merge logic for keel.
//!
//! Nothing in this crate touches a working tree, an index or a ref. It reads
//! and writes objects through [`keel_store::ObjectStore`] and returns plain
//! data for the caller to apply.
//!
//! - [`flat`]: trees flattened to `path -> entry` maps, and rebuilt.
//! - [`merge::text`]: diff3 line merge with conflict markers.
//! - [`merge::tree`]: per-path three-way tree merge.
//! - [`failpoints`]: the registry behind the `fp!` macro.

pub mod failpoints;
pub mod flat;
pub mod merge;

pub use flat::{FlatEntry, FlatTree, build_tree, flatten_commit, flatten_tree};
