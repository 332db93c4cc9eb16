use std::str::FromStr;

use anyhow::{Result, bail};
use serde_json::{Value, json};

use keel::{ChangeKind, ConflictedPath, OperationOutcome, RepoState, Status};

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One pretty-printed JSON document.
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => bail!("Invalid format '{s}'. Use: text or json"),
        }
    }
}

pub fn outcome(format: OutputFormat, outcome: &OperationOutcome) -> String {
    match format {
        OutputFormat::Json => pretty(&outcome_json(outcome)),
        OutputFormat::Text => match outcome {
            OperationOutcome::UpToDate => "Already up to date.".to_owned(),
            OperationOutcome::FastForward { commit } => format!("Fast-forward to {}", commit.short()),
            OperationOutcome::NonFastForward { commit } => format!("Created {}", commit.short()),
            OperationOutcome::Conflicts(paths) => {
                let mut out = String::from("Conflicts; resolve them, stage the result and commit:\n");
                for p in paths {
                    out.push_str(&format!("  {} ({})\n", p.path, p.reason));
                }
                out.trim_end().to_owned()
            }
        },
    }
}

fn outcome_json(outcome: &OperationOutcome) -> Value {
    match outcome {
        OperationOutcome::UpToDate => json!({ "result": "up_to_date" }),
        OperationOutcome::FastForward { commit } => {
            json!({ "result": "fast_forward", "commit": commit.to_string() })
        }
        OperationOutcome::NonFastForward { commit } => {
            json!({ "result": "non_fast_forward", "commit": commit.to_string() })
        }
        OperationOutcome::Conflicts(paths) => json!({
            "result": "conflicts",
            "conflicts": paths.iter().map(conflict_json).collect::<Vec<_>>(),
        }),
    }
}

fn conflict_json(c: &ConflictedPath) -> Value {
    let stage = |b: Option<keel::StagedBlob>| b.map(|b| b.oid.to_string());
    json!({
        "path": c.path,
        "reason": c.reason.to_string(),
        "ancestor": stage(c.ancestor),
        "ours": stage(c.ours),
        "theirs": stage(c.theirs),
    })
}

pub fn status(format: OutputFormat, status: &Status) -> String {
    match format {
        OutputFormat::Json => {
            let changes = |list: &[(String, ChangeKind)]| {
                list.iter()
                    .map(|(p, k)| json!({ "path": p, "change": k.to_string() }))
                    .collect::<Vec<_>>()
            };
            pretty(&json!({
                "head": status.head.to_string(),
                "state": state_label(&status.state),
                "staged": changes(&status.staged),
                "unstaged": changes(&status.unstaged),
                "untracked": status.untracked,
                "conflicted": status.conflicted,
            }))
        }
        OutputFormat::Text => {
            let mut out = format!("On {}\n", status.head);
            if let RepoState::InProgress { kind, .. } = &status.state {
                out.push_str(&format!("A {kind} is in progress.\n"));
            }
            for path in &status.conflicted {
                out.push_str(&format!("  U  {path}\n"));
            }
            for (path, kind) in &status.staged {
                out.push_str(&format!("  {kind}  {path}\n"));
            }
            for (path, kind) in &status.unstaged {
                out.push_str(&format!("   {kind} {path}\n"));
            }
            for path in &status.untracked {
                out.push_str(&format!("  ?? {path}\n"));
            }
            if status.is_clean() && status.untracked.is_empty() {
                out.push_str("nothing to commit, working tree clean\n");
            }
            out.trim_end().to_owned()
        }
    }
}

fn state_label(state: &RepoState) -> String {
    match state {
        RepoState::Clean => "clean".to_owned(),
        RepoState::Conflicted { .. } => "conflicted".to_owned(),
        RepoState::InProgress { kind, .. } => kind.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
