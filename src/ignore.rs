//! Which untracked files `remove_untracked_files` and `status` leave alone.
//!
//! Ignore-file parsing belongs to the caller. The repository consults an
//! [`IgnoreRules`] implementation; by default nothing is ignored.

use glob::Pattern;

use crate::error::{KeelError, KeelResult};

/// Decides whether an untracked path is ignored.
pub trait IgnoreRules: Send + Sync {
    /// `path` is repository-relative and `/`-separated.
    fn is_ignored(&self, path: &str) -> bool;
}

/// Ignores nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIgnore;

impl IgnoreRules for NoIgnore {
    fn is_ignored(&self, _path: &str) -> bool {
        false
    }
}

/// Glob patterns matched against the whole path and against each leading
/// directory, so `target` ignores everything under `target/` and `*.log`
/// ignores log files at any depth.
#[derive(Clone, Debug, Default)]
pub struct PatternIgnore {
    patterns: Vec<Pattern>,
}

impl PatternIgnore {
    /// # Errors
    /// Returns [`KeelError::InvalidPathspec`] for a malformed pattern.
    pub fn new<I, S>(patterns: I) -> KeelResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| KeelError::InvalidPathspec {
                    pattern: p.as_ref().to_owned(),
                    reason: e.to_string(),
                })
            })
            .collect::<KeelResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl IgnoreRules for PatternIgnore {
    fn is_ignored(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.patterns.iter().any(|p| {
            p.matches(path)
                || p.matches(name)
                || path
                    .match_indices('/')
                    .any(|(i, _)| p.matches(&path[..i]) || p.matches(dir_name(&path[..i])))
        })
    }
}

fn dir_name(dir: &str) -> &str {
    dir.rsplit('/').next().unwrap_or(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ignore_ignores_nothing() {
        assert!(!NoIgnore.is_ignored("anything"));
    }

    #[test]
    fn patterns_match_names_and_directories() {
        let rules = PatternIgnore::new(["*.log", "target", "build/out"]).unwrap();
        assert!(rules.is_ignored("debug.log"));
        assert!(rules.is_ignored("deep/dir/run.log"));
        assert!(rules.is_ignored("target/debug/app"));
        assert!(rules.is_ignored("crates/x/target/foo"));
        assert!(rules.is_ignored("build/out/a.o"));
        assert!(!rules.is_ignored("src/main.rs"));
        assert!(!rules.is_ignored("targets.txt"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(matches!(
            PatternIgnore::new(["[unclosed"]),
            Err(KeelError::InvalidPathspec { .. })
        ));
    }
}
