use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use keel::{
    CheckoutOptions, CheckoutPathsOptions, CleanOptions, CommitOptions, FastForward,
    MergeOptions, PathSource, ReplayOptions, Repository, ResetMode,
};

mod format;

use format::OutputFormat;

/// keel: commit, checkout, merge and friends over a content-addressed store
///
/// Every command operates on the repository at --repo (default: the
/// current directory). Set KEEL_LOG=debug to see what each operation does.
#[derive(Parser)]
#[command(name = "keel")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'keel <command> --help' for more information on a specific command.")]
struct Cli {
    /// Repository root (or bare repository directory)
    #[arg(long, global = true, default_value = ".", env = "KEEL_REPO")]
    repo: PathBuf,

    /// Output format: text or json
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResetArg {
    Soft,
    Mixed,
    Hard,
}

impl From<ResetArg> for ResetMode {
    fn from(arg: ResetArg) -> Self {
        match arg {
            ResetArg::Soft => Self::Soft,
            ResetArg::Mixed => Self::Mixed,
            ResetArg::Hard => Self::Hard,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty repository
    Init {
        /// Create a bare repository (no working tree)
        #[arg(long)]
        bare: bool,
    },

    /// Stage working-tree content (or deletions) for the next commit
    Add {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Record the index as a new commit
    Commit {
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(long)]
        allow_empty: bool,
    },

    /// Switch to a branch or commit, or restore paths with `-- <paths>`
    Checkout {
        /// Branch, tag or commit; with paths, the source tree (default HEAD)
        rev: Option<String>,
        /// Paths or glob patterns to restore instead of switching
        #[arg(last = true)]
        paths: Vec<String>,
        /// Discard local changes that would be overwritten
        #[arg(short, long)]
        force: bool,
        /// Restore paths from the index rather than a commit
        #[arg(long, conflicts_with = "rev")]
        from_index: bool,
        /// Treat paths literally; unmatched ones are skipped
        #[arg(long)]
        literal: bool,
    },

    /// Move HEAD, optionally resetting the index and working tree
    Reset {
        #[arg(default_value = "HEAD")]
        rev: String,
        #[arg(long, value_enum, default_value = "mixed")]
        mode: ResetArg,
    },

    /// Merge a branch or commit into HEAD
    Merge {
        rev: String,
        /// Fail unless the merge is a fast-forward
        #[arg(long, conflicts_with = "no_ff")]
        ff_only: bool,
        /// Create a merge commit even when a fast-forward is possible
        #[arg(long)]
        no_ff: bool,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Apply the change a commit introduced
    CherryPick {
        rev: String,
        /// Parent number to diff against, for merge commits
        #[arg(short, long)]
        mainline: Option<usize>,
        #[arg(long)]
        allow_empty: bool,
    },

    /// Undo the change a commit introduced, as a new commit
    Revert {
        rev: String,
        #[arg(short, long)]
        mainline: Option<usize>,
        #[arg(long)]
        allow_empty: bool,
    },

    /// Abandon a merge, cherry-pick or revert stopped on conflicts
    Abort,

    /// Delete files the index does not track
    Clean {
        /// Only list what would be deleted
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Show staged, unstaged, untracked and conflicted paths
    Status,

    /// List branches, or create one
    Branch {
        name: Option<String>,
        /// Start point (default HEAD)
        start: Option<String>,
    },

    /// List lock files left behind by interrupted operations
    Locks,
}

fn main() -> Result<()> {
    keel::telemetry::init();
    let cli = Cli::parse();
    let format = cli.format;

    match cli.command {
        Commands::Init { bare } => {
            if bare {
                Repository::init_bare(&cli.repo)?;
            } else {
                Repository::init(&cli.repo)?;
            }
            println!("Initialized empty keel repository in {}", cli.repo.display());
            Ok(())
        }
        command => {
            let repo = Repository::open(&cli.repo)
                .with_context(|| format!("opening repository at {}", cli.repo.display()))?;
            run(&repo, command, format)
        }
    }
}

fn run(repo: &Repository, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Init { .. } => bail!("a repository already exists here"),
        Commands::Add { paths } => repo.stage(&paths)?,
        Commands::Commit {
            message,
            allow_empty,
        } => {
            let commit = repo.commit(&CommitOptions {
                allow_empty,
                ..CommitOptions::new(message)
            })?;
            println!("[{}] {}", repo.head()?, commit.short());
        }
        Commands::Checkout {
            rev,
            paths,
            force,
            from_index,
            literal,
        } => {
            if paths.is_empty() {
                let Some(rev) = rev else {
                    bail!("nothing to check out: give a revision or `-- <paths>`");
                };
                let head = repo.checkout(
                    &rev,
                    &CheckoutOptions {
                        force,
                        cancel: None,
                    },
                )?;
                println!("Switched to {head}");
            } else {
                let source = match rev {
                    _ if from_index => PathSource::Index,
                    Some(rev) => PathSource::Revision(rev),
                    None => PathSource::default(),
                };
                let restored = repo.checkout_paths(
                    &source,
                    &paths,
                    &CheckoutPathsOptions {
                        force,
                        literal,
                        cancel: None,
                    },
                )?;
                println!("Updated {} path(s)", restored.len());
            }
        }
        Commands::Reset { rev, mode } => {
            let commit = repo.reset(&rev, mode.into())?;
            println!("HEAD is now at {}", commit.short());
        }
        Commands::Merge {
            rev,
            ff_only,
            no_ff,
            message,
        } => {
            let fast_forward = match (ff_only, no_ff) {
                (true, _) => FastForward::Only,
                (_, true) => FastForward::Never,
                _ => FastForward::Allow,
            };
            let outcome = repo.merge(
                &rev,
                &MergeOptions {
                    fast_forward,
                    message,
                    cancel: None,
                },
            )?;
            println!("{}", format::outcome(format, &outcome));
        }
        Commands::CherryPick {
            rev,
            mainline,
            allow_empty,
        } => {
            let outcome = repo.cherry_pick(&rev, &replay(mainline, allow_empty))?;
            println!("{}", format::outcome(format, &outcome));
        }
        Commands::Revert {
            rev,
            mainline,
            allow_empty,
        } => {
            let outcome = repo.revert(&rev, &replay(mainline, allow_empty))?;
            println!("{}", format::outcome(format, &outcome));
        }
        Commands::Abort => {
            repo.abort_operation()?;
            println!("Aborted.");
        }
        Commands::Clean { dry_run } => {
            let removed = repo.remove_untracked_files(&CleanOptions { dry_run })?;
            let verb = if dry_run { "Would remove" } else { "Removed" };
            for path in removed {
                println!("{verb} {path}");
            }
        }
        Commands::Status => println!("{}", format::status(format, &repo.status()?)),
        Commands::Branch { name, start } => match name {
            Some(name) => {
                let branch = repo.create_branch(&name, start.as_deref())?;
                println!("Created {branch}");
            }
            None => {
                let current = repo.head()?.branch().cloned();
                for (name, _) in repo.branches()? {
                    let marker = if current.as_ref() == Some(&name) { '*' } else { ' ' };
                    println!("{marker} {}", name.branch_name().unwrap_or(name.as_str()));
                }
            }
        },
        Commands::Locks => {
            for lock in repo.stale_locks()? {
                println!("{}", lock.display());
            }
        }
    }
    Ok(())
}

fn replay(mainline: Option<usize>, allow_empty: bool) -> ReplayOptions {
    ReplayOptions {
        mainline,
        allow_empty,
        ..ReplayOptions::default()
    }
}
