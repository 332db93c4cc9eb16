//! Reading and moving HEAD.
//!
//! Every update is a compare-and-set against the value read when the
//! operation started, followed by reflog entries for the moved ref and for
//! HEAD. A concurrent change between the read and the update surfaces as
//! [`KeelError::LockContention`](crate::KeelError::LockContention).

use keel_store::{ObjectId, RefName, RefStore, RefTarget, ReflogEntry, Signature};
use tracing::info;

use crate::error::{KeelError, KeelResult};

/// Where HEAD points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Head {
    /// Attached to a branch; `target` is `None` while the branch is unborn.
    Branch {
        name: RefName,
        target: Option<ObjectId>,
    },
    Detached { target: ObjectId },
}

impl Head {
    /// Read HEAD. A missing HEAD is reported as not a repository.
    ///
    /// # Errors
    /// Returns [`KeelError::State`] if HEAD is missing or points somewhere
    /// other than a branch.
    pub fn read(refs: &dyn RefStore) -> KeelResult<Self> {
        let head = RefName::head();
        match refs.read(&head)? {
            None => Err(KeelError::State {
                message: "HEAD is missing".to_owned(),
            }),
            Some(RefTarget::Direct(target)) => Ok(Self::Detached { target }),
            Some(RefTarget::Symbolic(_)) => {
                let resolved = refs.resolve(&head)?;
                if resolved.name.branch_name().is_none() {
                    return Err(KeelError::State {
                        message: format!("HEAD points at {}, which is not a branch", resolved.name),
                    });
                }
                Ok(Self::Branch {
                    name: resolved.name,
                    target: resolved.target,
                })
            }
        }
    }

    /// The commit HEAD resolves to, `None` when unborn.
    #[must_use]
    pub const fn commit(&self) -> Option<ObjectId> {
        match self {
            Self::Branch { target, .. } => *target,
            Self::Detached { target } => Some(*target),
        }
    }

    #[must_use]
    pub const fn branch(&self) -> Option<&RefName> {
        match self {
            Self::Branch { name, .. } => Some(name),
            Self::Detached { .. } => None,
        }
    }

    /// HEAD's own raw value.
    fn raw(&self) -> RefTarget {
        match self {
            Self::Branch { name, .. } => RefTarget::Symbolic(name.clone()),
            Self::Detached { target } => RefTarget::Direct(*target),
        }
    }
}

impl std::fmt::Display for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch { name, target } => {
                let short = name.branch_name().unwrap_or(name.as_str());
                match target {
                    Some(t) => write!(f, "{short} ({})", t.short()),
                    None => write!(f, "{short} (no commits yet)"),
                }
            }
            Self::Detached { target } => write!(f, "detached at {}", target.short()),
        }
    }
}

/// Move the commit HEAD resolves to: the branch when attached, HEAD itself
/// when detached.
///
/// # Errors
/// Returns [`KeelError::LockContention`] if the ref moved since `head` was
/// read.
pub fn advance_head(
    refs: &dyn RefStore,
    head: &Head,
    new: ObjectId,
    committer: &Signature,
    message: &str,
) -> KeelResult<()> {
    let entry = ReflogEntry {
        old: head.commit(),
        new,
        committer: committer.clone(),
        message: message.to_owned(),
    };
    match head {
        Head::Branch { name, target } => {
            let expected = target.map(RefTarget::Direct);
            refs.compare_and_set(name, expected.as_ref(), &RefTarget::Direct(new))?;
            refs.append_reflog(name, &entry)?;
            refs.append_reflog(&RefName::head(), &entry)?;
            info!(branch = %name, from = ?head.commit(), to = %new, "branch moved");
        }
        Head::Detached { target } => {
            refs.compare_and_set(
                &RefName::head(),
                Some(&RefTarget::Direct(*target)),
                &RefTarget::Direct(new),
            )?;
            refs.append_reflog(&RefName::head(), &entry)?;
            info!(from = %target, to = %new, "detached HEAD moved");
        }
    }
    Ok(())
}

/// Where [`switch_head`] leaves HEAD.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadTarget {
    /// Attach to an existing branch whose tip is `commit`.
    Branch { name: RefName, commit: ObjectId },
    Detached(ObjectId),
}

/// Re-point HEAD itself (attach to a branch or detach), leaving branch
/// refs alone.
///
/// # Errors
/// Returns [`KeelError::LockContention`] if HEAD changed since `head` was
/// read.
pub fn switch_head(
    refs: &dyn RefStore,
    head: &Head,
    to: &HeadTarget,
    committer: &Signature,
    message: &str,
) -> KeelResult<()> {
    let (new_raw, new_commit) = match to {
        HeadTarget::Branch { name, commit } => (RefTarget::Symbolic(name.clone()), *commit),
        HeadTarget::Detached(commit) => (RefTarget::Direct(*commit), *commit),
    };
    let old_raw = head.raw();
    if old_raw != new_raw {
        refs.compare_and_set(&RefName::head(), Some(&old_raw), &new_raw)?;
    }
    refs.append_reflog(
        &RefName::head(),
        &ReflogEntry {
            old: head.commit(),
            new: new_commit,
            committer: committer.clone(),
            message: message.to_owned(),
        },
    )?;
    info!(head = %new_raw, "HEAD switched");
    Ok(())
}

/// Record `previous` in `ORIG_HEAD`, replacing whatever was there.
///
/// # Errors
/// Returns a store error if the ref cannot be written.
pub fn set_orig_head(refs: &dyn RefStore, previous: ObjectId) -> KeelResult<()> {
    let name = RefName::orig_head();
    let current = refs.read(&name)?;
    refs.compare_and_set(&name, current.as_ref(), &RefTarget::Direct(previous))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::MemoryRefStore;

    fn sig() -> Signature {
        Signature::now("t", "t@example.com")
    }

    fn oid(seed: &[u8]) -> ObjectId {
        ObjectId::for_blob(seed)
    }

    fn on_main(refs: &MemoryRefStore) {
        refs.compare_and_set(
            &RefName::head(),
            None,
            &RefTarget::Symbolic(RefName::branch("main").unwrap()),
        )
        .unwrap();
    }

    #[test]
    fn unborn_branch_then_advance() {
        let refs = MemoryRefStore::new();
        on_main(&refs);
        let head = Head::read(&refs).unwrap();
        assert_eq!(head.commit(), None);
        assert_eq!(head.branch().unwrap().as_str(), "refs/heads/main");

        advance_head(&refs, &head, oid(b"1"), &sig(), "commit (initial): one").unwrap();
        let head = Head::read(&refs).unwrap();
        assert_eq!(head.commit(), Some(oid(b"1")));

        let log = refs.reflog(&RefName::branch("main").unwrap()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].old, None);
        assert_eq!(refs.reflog(&RefName::head()).unwrap().len(), 1);
    }

    #[test]
    fn stale_head_is_contention() {
        let refs = MemoryRefStore::new();
        on_main(&refs);
        let stale = Head::read(&refs).unwrap();
        advance_head(&refs, &stale, oid(b"1"), &sig(), "first").unwrap();
        let err = advance_head(&refs, &stale, oid(b"2"), &sig(), "second").unwrap_err();
        assert!(matches!(err, KeelError::LockContention { .. }), "{err}");
        assert_eq!(Head::read(&refs).unwrap().commit(), Some(oid(b"1")));
    }

    #[test]
    fn detach_and_reattach() {
        let refs = MemoryRefStore::new();
        on_main(&refs);
        let head = Head::read(&refs).unwrap();
        advance_head(&refs, &head, oid(b"1"), &sig(), "first").unwrap();

        let head = Head::read(&refs).unwrap();
        switch_head(&refs, &head, &HeadTarget::Detached(oid(b"1")), &sig(), "detach").unwrap();
        let detached = Head::read(&refs).unwrap();
        assert_eq!(detached, Head::Detached { target: oid(b"1") });

        advance_head(&refs, &detached, oid(b"2"), &sig(), "move").unwrap();
        // branch stays where it was
        let main = RefName::branch("main").unwrap();
        assert_eq!(refs.resolve(&main).unwrap().target, Some(oid(b"1")));

        let detached = Head::read(&refs).unwrap();
        switch_head(
            &refs,
            &detached,
            &HeadTarget::Branch {
                name: main,
                commit: oid(b"1"),
            },
            &sig(),
            "attach",
        )
        .unwrap();
        assert!(matches!(Head::read(&refs).unwrap(), Head::Branch { .. }));
    }

    #[test]
    fn orig_head_is_overwritten() {
        let refs = MemoryRefStore::new();
        set_orig_head(&refs, oid(b"1")).unwrap();
        set_orig_head(&refs, oid(b"2")).unwrap();
        assert_eq!(
            refs.read(&RefName::orig_head()).unwrap(),
            Some(RefTarget::Direct(oid(b"2")))
        );
    }
}
