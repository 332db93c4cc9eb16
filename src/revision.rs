//! Revision strings to commit ids.
//!
//! Accepted forms, with optional `~n` / `^n` suffixes (`n` defaults to 1,
//! `^0` is the commit itself):
//!
//! - `HEAD`, `ORIG_HEAD`
//! - a full ref name (`refs/heads/main`)
//! - a branch or tag name (`main`, `v1.0`); tags are peeled to commits
//! - a full 64-character id, or a unique hex prefix of at least 4 characters

use keel_store::{Object, ObjectId, ObjectStore, RefName, RefStore, RefTarget};

use crate::error::{KeelError, KeelResult};

/// Shortest hex prefix accepted as an abbreviated id.
pub const MIN_PREFIX_LEN: usize = 4;

/// Tag chains longer than this are rejected.
const MAX_PEEL_DEPTH: usize = 8;

/// A resolved revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    pub commit: ObjectId,
    /// Set when the string named a branch exactly (no suffix), so checkout
    /// can attach HEAD to it.
    pub branch: Option<RefName>,
}

/// Resolve `spec` to a commit.
///
/// # Errors
/// Returns [`KeelError::AmbiguousRevision`] when a name or prefix matches
/// more than one commit, and [`KeelError::InvalidRevision`] when it matches
/// nothing, names an unborn ref or walks past a root commit.
pub fn resolve(
    store: &dyn ObjectStore,
    refs: &dyn RefStore,
    spec: &str,
) -> KeelResult<Revision> {
    let invalid = |reason: String| KeelError::InvalidRevision {
        spec: spec.to_owned(),
        reason,
    };
    let split = spec.find(['~', '^']).unwrap_or(spec.len());
    let (base, suffix) = spec.split_at(split);
    if base.is_empty() {
        return Err(invalid("empty revision".to_owned()));
    }

    let (mut commit, branch) = resolve_base(store, refs, spec, base)?;
    let steps = parse_suffix(suffix).map_err(invalid)?;
    for (kind, n) in &steps {
        commit = match kind {
            Step::Ancestor => {
                let mut current = commit;
                for _ in 0..*n {
                    current = *store
                        .read_commit(current)?
                        .parents
                        .first()
                        .ok_or_else(|| invalid(format!("{} has no parent", current.short())))?;
                }
                current
            }
            Step::Parent if *n == 0 => commit,
            Step::Parent => *store
                .read_commit(commit)?
                .parents
                .get(*n - 1)
                .ok_or_else(|| invalid(format!("{} has no parent {n}", commit.short())))?,
        };
    }
    Ok(Revision {
        commit,
        branch: if steps.is_empty() { branch } else { None },
    })
}

/// Resolve `spec` and return only the commit id.
///
/// # Errors
/// As [`resolve`].
pub fn resolve_commit(
    store: &dyn ObjectStore,
    refs: &dyn RefStore,
    spec: &str,
) -> KeelResult<ObjectId> {
    resolve(store, refs, spec).map(|r| r.commit)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// `~n`: n first-parent hops.
    Ancestor,
    /// `^n`: the n-th parent.
    Parent,
}

fn parse_suffix(mut suffix: &str) -> Result<Vec<(Step, usize)>, String> {
    let mut steps = Vec::new();
    while let Some(c) = suffix.chars().next() {
        let kind = match c {
            '~' => Step::Ancestor,
            '^' => Step::Parent,
            other => return Err(format!("unexpected `{other}` in suffix")),
        };
        suffix = &suffix[1..];
        let digits = suffix.find(|c: char| !c.is_ascii_digit()).unwrap_or(suffix.len());
        let n = if digits == 0 {
            1
        } else {
            suffix[..digits]
                .parse::<usize>()
                .map_err(|e| format!("bad count: {e}"))?
        };
        suffix = &suffix[digits..];
        steps.push((kind, n));
    }
    Ok(steps)
}

fn resolve_base(
    store: &dyn ObjectStore,
    refs: &dyn RefStore,
    spec: &str,
    base: &str,
) -> KeelResult<(ObjectId, Option<RefName>)> {
    let invalid = |reason: String| KeelError::InvalidRevision {
        spec: spec.to_owned(),
        reason,
    };

    if base == "HEAD" || base == "ORIG_HEAD" || base.starts_with("refs/") {
        let name = RefName::new(base).map_err(|e| invalid(e.to_string()))?;
        if refs.read(&name)?.is_none() && name != RefName::head() {
            return Err(invalid(format!("ref {base} does not exist")));
        }
        let resolved = refs.resolve(&name)?;
        let target = resolved
            .target
            .ok_or_else(|| invalid(format!("{} has no commits yet", resolved.name)))?;
        let branch = resolved.name.branch_name().is_some().then_some(resolved.name);
        let branch = if base == "HEAD" { None } else { branch };
        return Ok((peel(store, spec, target)?, branch));
    }

    let branch = lookup_ref(refs, RefName::branch(base).ok())?;
    let tag = lookup_ref(refs, RefName::tag(base).ok())?;
    match (branch, tag) {
        (Some((name, oid)), None) => return Ok((peel(store, spec, oid)?, Some(name))),
        (None, Some((_, oid))) => return Ok((peel(store, spec, oid)?, None)),
        (Some((bname, b)), Some((tname, t))) => {
            let b = peel(store, spec, b)?;
            let t = peel(store, spec, t)?;
            if b != t {
                return Err(KeelError::AmbiguousRevision {
                    spec: spec.to_owned(),
                    candidates: vec![bname.to_string(), tname.to_string()],
                });
            }
            return Ok((b, Some(bname)));
        }
        (None, None) => {}
    }

    if !base.bytes().all(|b| b.is_ascii_hexdigit()) || base.len() < MIN_PREFIX_LEN {
        return Err(invalid("unknown revision".to_owned()));
    }
    let prefix = base.to_ascii_lowercase();
    let mut matches = Vec::new();
    for oid in store.ids_with_prefix(&prefix)? {
        if let Ok(commit) = peel(store, spec, oid) {
            matches.push((oid, commit));
        }
    }
    match matches.as_slice() {
        [] => Err(invalid("no commit with that id".to_owned())),
        [(_, commit)] => Ok((*commit, None)),
        many => Err(KeelError::AmbiguousRevision {
            spec: spec.to_owned(),
            candidates: many.iter().map(|(oid, _)| oid.short()).collect(),
        }),
    }
}

/// Read `name` (if valid) and follow it to a direct id.
fn lookup_ref(
    refs: &dyn RefStore,
    name: Option<RefName>,
) -> KeelResult<Option<(RefName, ObjectId)>> {
    let Some(name) = name else {
        return Ok(None);
    };
    match refs.read(&name)? {
        None => Ok(None),
        Some(RefTarget::Direct(oid)) => Ok(Some((name, oid))),
        Some(RefTarget::Symbolic(_)) => Ok(refs.resolve(&name)?.target.map(|oid| (name, oid))),
    }
}

/// Follow tags until a commit is reached.
fn peel(store: &dyn ObjectStore, spec: &str, oid: ObjectId) -> KeelResult<ObjectId> {
    let mut current = oid;
    for _ in 0..MAX_PEEL_DEPTH {
        match store.read(current)? {
            Some(Object::Commit(_)) => return Ok(current),
            Some(Object::Tag(tag)) => current = tag.target,
            Some(other) => {
                return Err(KeelError::InvalidRevision {
                    spec: spec.to_owned(),
                    reason: format!("{} is a {}, not a commit", current.short(), other.kind()),
                });
            }
            None => return Err(KeelError::ObjectNotFound { oid: current }),
        }
    }
    Err(KeelError::InvalidRevision {
        spec: spec.to_owned(),
        reason: "tag chain too long".to_owned(),
    })
}
