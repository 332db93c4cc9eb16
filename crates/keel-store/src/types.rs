//! Core value types for the keel store layer.
//!
//! These types form the vocabulary shared between the [`ObjectStore`],
//! [`RefStore`] and [`WorkTree`] traits and every keel crate above them.
//!
//! [`ObjectStore`]: crate::ObjectStore
//! [`RefStore`]: crate::RefStore
//! [`WorkTree`]: crate::WorkTree

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

/// A content-derived object identifier (SHA-256, 32 bytes).
///
/// Stored as raw bytes for cheap comparison, hashing and `Copy` semantics.
/// Displays as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Number of hex characters in the display form.
    pub const HEX_LEN: usize = 64;

    /// Create an `ObjectId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash an already-encoded object (header plus payload).
    #[must_use]
    pub fn hash_encoded(encoded: &[u8]) -> Self {
        Self(Sha256::digest(encoded).into())
    }

    /// The id a blob with `content` would be stored under.
    ///
    /// Equivalent to encoding `Object::Blob(content)` and hashing it, without
    /// copying the content.
    #[must_use]
    pub fn for_blob(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{} {}\0", ObjectKind::Blob, content.len()).as_bytes());
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// The first 12 hex characters, for log lines and conflict labels.
    #[must_use]
    pub fn short(&self) -> String {
        let mut hex = self.to_string();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl FromStr for ObjectId {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(OidParseError {
                value: s.to_owned(),
                reason: format!("expected {} hex characters, got {}", Self::HEX_LEN, s.len()),
            });
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0]).ok_or_else(|| invalid_digit(s, chunk[0]))?;
            let lo = hex_digit(chunk[1]).ok_or_else(|| invalid_digit(s, chunk[1]))?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Error from parsing a hex string into an [`ObjectId`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid object id {value:?}: {reason}")]
pub struct OidParseError {
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

fn invalid_digit(value: &str, digit: u8) -> OidParseError {
    OidParseError {
        value: value.to_owned(),
        reason: format!("invalid hex digit '{}'", digit as char),
    }
}

/// Parse one hex digit. Uppercase is accepted when parsing user input.
#[must_use]
pub const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// The kind tag written into every encoded object header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectKind {
    /// The header token for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parse a header token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "blob" => Some(Self::Blob),
            "tree" => Some(Self::Tree),
            "commit" => Some(Self::Commit),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mode of a tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// Regular file (`100644`).
    Blob,
    /// Executable file (`100755`).
    BlobExecutable,
    /// Symbolic link (`120000`); the blob holds the link target.
    Link,
    /// Subdirectory (`040000`).
    Tree,
}

impl EntryMode {
    /// The conventional octal rendering (as in `ls-tree`).
    #[must_use]
    pub const fn as_octal(self) -> u32 {
        match self {
            Self::Blob => 0o100_644,
            Self::BlobExecutable => 0o100_755,
            Self::Link => 0o120_000,
            Self::Tree => 0o040_000,
        }
    }

    /// `true` for regular and executable files.
    #[must_use]
    pub const fn is_file(self) -> bool {
        matches!(self, Self::Blob | Self::BlobExecutable)
    }

    /// `true` for anything stored as a blob (files and symlinks).
    #[must_use]
    pub const fn is_blob_like(self) -> bool {
        !matches!(self, Self::Tree)
    }
}

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Basename only; never empty and never contains `/`.
    pub name: String,
    pub mode: EntryMode,
    pub oid: ObjectId,
}

impl TreeEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, mode: EntryMode, oid: ObjectId) -> Self {
        Self {
            name: name.into(),
            mode,
            oid,
        }
    }
}

/// A validated, name-sorted list of tree entries.
///
/// Construction rejects duplicate names, empty names and names containing a
/// path separator, so every `Tree` in the store is well formed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TreeEntry>", into = "Vec<TreeEntry>")]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree, sorting entries by name.
    ///
    /// # Errors
    /// Returns [`TreeError`] when a name is empty, contains `/`, is `.` or
    /// `..`, or appears more than once.
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self, TreeError> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in &entries {
            if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
                return Err(TreeError(format!("invalid entry name {:?}", entry.name)));
            }
            if entry.name.contains('/') || entry.name.contains('\0') {
                return Err(TreeError(format!(
                    "entry name {:?} contains a separator",
                    entry.name
                )));
            }
        }
        if let Some(pair) = entries.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(TreeError(format!("duplicate entry {:?}", pair[0].name)));
        }
        Ok(Self { entries })
    }

    /// The tree with no entries.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Look up an entry by basename.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl TryFrom<Vec<TreeEntry>> for Tree {
    type Error = TreeError;

    fn try_from(entries: Vec<TreeEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<Tree> for Vec<TreeEntry> {
    fn from(tree: Tree) -> Self {
        tree.entries
    }
}

/// Why a [`Tree`] could not be constructed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TreeError(pub String);

/// Seconds since the Unix epoch plus the author's UTC offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub offset_minutes: i32,
}

impl Timestamp {
    #[must_use]
    pub const fn new(seconds: i64, offset_minutes: i32) -> Self {
        Self {
            seconds,
            offset_minutes,
        }
    }

    /// The current time, in UTC.
    #[must_use]
    pub fn now() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Self::new(seconds, 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let abs = self.offset_minutes.unsigned_abs();
        write!(f, "{} {sign}{:02}{:02}", self.seconds, abs / 60, abs % 60)
    }
}

/// Who made a change, and when.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: Timestamp,
}

impl Signature {
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>, when: Timestamp) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when,
        }
    }

    /// A signature stamped with the current time.
    #[must_use]
    pub fn now(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self::new(name, email, Timestamp::now())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.when)
    }
}

/// A commit object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectId,
    /// Ordered; the first parent is the branch the commit was made on.
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl Commit {
    /// The first line of the message.
    #[must_use]
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim_end()
    }

    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// An annotated tag object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub target: ObjectId,
    pub target_kind: ObjectKind,
    pub name: String,
    pub tagger: Option<Signature>,
    pub message: String,
}

/// Any object the store can hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    Blob(Vec<u8>),
    Tree(Tree),
    Commit(Commit),
    Tag(Tag),
}

impl Object {
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Blob(_) => ObjectKind::Blob,
            Self::Tree(_) => ObjectKind::Tree,
            Self::Commit(_) => ObjectKind::Commit,
            Self::Tag(_) => ObjectKind::Tag,
        }
    }
}

// ---------------------------------------------------------------------------
// RefName
// ---------------------------------------------------------------------------

/// A validated reference name.
///
/// Must start with `refs/` or be one of the well-known bare names (`HEAD`,
/// `ORIG_HEAD`, ...). Components may not be empty, start with `.`, or end
/// with `.lock`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefName(String);

/// Well-known bare ref names that don't start with `refs/`.
const BARE_REFS: &[&str] = &[
    "HEAD",
    "ORIG_HEAD",
    "MERGE_HEAD",
    "CHERRY_PICK_HEAD",
    "REVERT_HEAD",
];

const BRANCH_PREFIX: &str = "refs/heads/";

impl RefName {
    /// Create a new `RefName`, validating it.
    ///
    /// # Errors
    /// Returns [`RefNameError`] if the name is malformed.
    pub fn new(name: &str) -> Result<Self, RefNameError> {
        Self::validate(name)?;
        Ok(Self(name.to_owned()))
    }

    /// `HEAD`.
    #[must_use]
    pub fn head() -> Self {
        Self("HEAD".to_owned())
    }

    /// `ORIG_HEAD`, the pre-reset position of HEAD.
    #[must_use]
    pub fn orig_head() -> Self {
        Self("ORIG_HEAD".to_owned())
    }

    /// `refs/heads/<short>`.
    ///
    /// # Errors
    /// Returns [`RefNameError`] if `short` is not a valid branch name.
    pub fn branch(short: &str) -> Result<Self, RefNameError> {
        Self::new(&format!("{BRANCH_PREFIX}{short}"))
    }

    /// `refs/tags/<short>`.
    ///
    /// # Errors
    /// Returns [`RefNameError`] if `short` is not a valid tag name.
    pub fn tag(short: &str) -> Result<Self, RefNameError> {
        Self::new(&format!("refs/tags/{short}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The short branch name, if this is a `refs/heads/` ref.
    #[must_use]
    pub fn branch_name(&self) -> Option<&str> {
        self.0.strip_prefix(BRANCH_PREFIX)
    }

    fn validate(name: &str) -> Result<(), RefNameError> {
        let fail = |reason: &str| {
            Err(RefNameError {
                value: name.to_owned(),
                reason: reason.to_owned(),
            })
        };
        if name.is_empty() {
            return fail("ref name must not be empty");
        }
        if BARE_REFS.contains(&name) {
            return Ok(());
        }
        if !name.starts_with("refs/") {
            return fail("ref name must start with 'refs/' or be a well-known ref (HEAD, etc.)");
        }
        for component in name.split('/') {
            if component.is_empty() {
                return fail("ref name has an empty component");
            }
            if component.starts_with('.') || component.ends_with(".lock") {
                return fail("ref component may not start with '.' or end with '.lock'");
            }
        }
        if name
            .chars()
            .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
            || name.contains("..")
            || name.contains("@{")
        {
            return fail("ref name contains a forbidden character sequence");
        }
        Ok(())
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RefName {
    type Err = RefNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RefName {
    type Error = RefNameError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<RefName> for String {
    fn from(name: RefName) -> Self {
        name.0
    }
}

/// Error from validating a [`RefName`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid ref name {value:?}: {reason}")]
pub struct RefNameError {
    /// The invalid value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// What a reference points at.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefTarget {
    Direct(ObjectId),
    Symbolic(RefName),
}

impl fmt::Display for RefTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(oid) => write!(f, "{oid}"),
            Self::Symbolic(name) => write!(f, "ref: {name}"),
        }
    }
}

/// One line of a reference's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflogEntry {
    /// `None` when the ref did not exist before the update.
    pub old: Option<ObjectId>,
    pub new: ObjectId,
    pub committer: Signature,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Working tree
// ---------------------------------------------------------------------------

/// Metadata about a working-tree file, as cheap to obtain as a `stat(2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    /// [`EntryMode::Blob`], [`EntryMode::BlobExecutable`] or [`EntryMode::Link`].
    pub mode: EntryMode,
}
