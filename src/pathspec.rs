//! Path patterns given to `stage` and `checkout_paths`.
//!
//! A pattern matches a path when it matches the path itself or any of its
//! leading directories, so `src` and `src/*` both select `src/lib.rs`.
//! `.` selects everything.

use glob::{MatchOptions, Pattern};

use crate::error::{KeelError, KeelResult};

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Clone, Debug)]
enum Matcher {
    Everything,
    Literal(String),
    Glob(Pattern),
}

impl Matcher {
    fn matches(&self, path: &str) -> bool {
        let exact = |candidate: &str| match self {
            Self::Everything => true,
            Self::Literal(lit) => candidate == lit,
            Self::Glob(p) => p.matches_with(candidate, MATCH),
        };
        exact(path)
            || path
                .match_indices('/')
                .any(|(i, _)| exact(&path[..i]))
    }
}

/// A compiled list of patterns.
#[derive(Clone, Debug)]
pub struct Pathspec {
    patterns: Vec<(String, Matcher)>,
}

impl Pathspec {
    /// Compile `patterns` as globs, or as literal paths when `literal`.
    ///
    /// # Errors
    /// Returns [`KeelError::InvalidPathspec`] for a malformed glob.
    pub fn new<S: AsRef<str>>(patterns: &[S], literal: bool) -> KeelResult<Self> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                let raw = raw.as_ref();
                let trimmed = raw.trim_end_matches('/');
                let matcher = if trimmed.is_empty() || trimmed == "." {
                    Matcher::Everything
                } else if literal {
                    Matcher::Literal(trimmed.to_owned())
                } else {
                    Matcher::Glob(Pattern::new(trimmed).map_err(|e| KeelError::InvalidPathspec {
                        pattern: raw.to_owned(),
                        reason: e.to_string(),
                    })?)
                };
                Ok((raw.to_owned(), matcher))
            })
            .collect::<KeelResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// `true` if any pattern selects `path`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|(_, m)| m.matches(path))
    }

    /// Select the paths some pattern matches, and report the patterns that
    /// matched none of `paths`.
    pub fn select<'a, I>(&self, paths: I) -> (Vec<&'a str>, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hit = vec![false; self.patterns.len()];
        let mut selected = Vec::new();
        for path in paths {
            let mut any = false;
            for (i, (_, m)) in self.patterns.iter().enumerate() {
                if m.matches(path) {
                    hit[i] = true;
                    any = true;
                }
            }
            if any {
                selected.push(path);
            }
        }
        let unmatched = self
            .patterns
            .iter()
            .zip(hit)
            .filter(|(_, hit)| !hit)
            .map(|((raw, _), _)| raw.clone())
            .collect();
        (selected, unmatched)
    }
}
