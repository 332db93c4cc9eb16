//! Repository configuration (`<meta>/config.toml`).
//!
//! Missing file means all defaults. Unknown keys are rejected so typos do
//! not silently fall back to defaults.
//!
//! ```toml
//! [user]
//! name = "Ada Lovelace"
//! email = "ada@example.com"
//!
//! [core]
//! default_branch = "main"
//! lock_timeout_ms = 0
//!
//! [merge]
//! conflict_style = "diff3"
//! marker_size = 7
//!
//! [commit]
//! allow_empty = false
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_core::merge::ConflictStyle;
use keel_store::Signature;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeelConfig {
    /// Identity used when an operation is not given one explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Identity>,

    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub commit: CommitConfig,
}

/// A name and email pair, stamped with the current time on use.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// A signature for this identity at the current time.
    #[must_use]
    pub fn signature(&self) -> Signature {
        Signature::now(&self.name, &self.email)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Branch HEAD points at in a fresh repository.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// How long to wait for `index.json.lock` before failing (0 = fail at once).
    #[serde(default)]
    pub lock_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            lock_timeout_ms: 0,
        }
    }
}

fn default_branch() -> String {
    "main".to_owned()
}

impl CoreConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default)]
    pub conflict_style: ConflictStyle,

    #[serde(default = "default_marker_size")]
    pub marker_size: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            conflict_style: ConflictStyle::default(),
            marker_size: default_marker_size(),
        }
    }
}

const fn default_marker_size() -> usize {
    7
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CommitConfig {
    /// Accept commits whose tree equals the parent's tree.
    #[serde(default)]
    pub allow_empty: bool,
}

/// A configuration file that could not be read or parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    /// Includes the line number when the parser reports one.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl KeelConfig {
    /// Load configuration from a TOML file; a missing file yields defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on I/O errors other than not-found, invalid
    /// TOML, unknown keys, or a zero marker size.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on invalid TOML, unknown keys, or invalid values.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].matches('\n').count() + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        if config.merge.marker_size == 0 {
            return Err(ConfigError {
                path: None,
                message: "merge.marker_size must be at least 1".to_owned(),
            });
        }
        Ok(config)
    }

    /// Serialize back to TOML.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError {
            path: None,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = KeelConfig::parse("").unwrap();
        assert_eq!(config, KeelConfig::default());
        assert_eq!(config.core.default_branch, "main");
        assert_eq!(config.merge.marker_size, 7);
        assert_eq!(config.merge.conflict_style, ConflictStyle::Merge);
        assert!(config.user.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = KeelConfig::parse(
            r#"
[user]
name = "Ada"
email = "ada@example.com"

[core]
default_branch = "trunk"
lock_timeout_ms = 250

[merge]
conflict_style = "diff3"
marker_size = 9

[commit]
allow_empty = true
"#,
        )
        .unwrap();
        assert_eq!(config.user, Some(Identity::new("Ada", "ada@example.com")));
        assert_eq!(config.core.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.merge.conflict_style, ConflictStyle::Diff3);
        assert_eq!(config.merge.marker_size, 9);
        assert!(config.commit.allow_empty);
    }

    #[test]
    fn unknown_key_reports_line() {
        let err = KeelConfig::parse("[core]\nlock_timeout_ms = 1\nbogus = true\n").unwrap_err();
        assert!(err.message.contains("line 3"), "got: {err}");
    }

    #[test]
    fn zero_marker_size_rejected() {
        assert!(KeelConfig::parse("[merge]\nmarker_size = 0\n").is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeelConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, KeelConfig::default());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = KeelConfig::default();
        config.user = Some(Identity::new("B", "b@example.com"));
        config.merge.conflict_style = ConflictStyle::Diff3;
        let text = config.to_toml().unwrap();
        assert_eq!(KeelConfig::parse(&text).unwrap(), config);
    }
}
