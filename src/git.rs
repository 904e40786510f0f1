//! Git adapter.
//!
//! Every git invocation goes through [`Git`], which runs `git` in a fixed
//! working directory via [`Tool`]. Failures surface as `ExitError::ToolFailed`
//! carrying git's exit code and captured output.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, instrument};

use crate::subprocess::{RunOutput, Tool};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> anyhow::Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> anyhow::Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// `git pull <remote> <branch>`. Callers treat failure as "no remote".
    pub fn pull(&self, remote: &str, branch: &str) -> anyhow::Result<RunOutput> {
        self.run(&["pull", remote, branch])
    }

    /// Merge `branch` into the checked-out branch with a merge commit.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> anyhow::Result<()> {
        self.run_checked(&["merge", "--no-ff", "-m", message, branch])?;
        Ok(())
    }

    /// Start a merge without committing it, for conflict probing.
    pub fn merge_no_commit(&self, branch: &str) -> anyhow::Result<RunOutput> {
        self.run(&["merge", "--no-commit", "--no-ff", branch])
    }

    /// Abort an in-progress merge. Fails harmlessly when none is in progress.
    pub fn merge_abort(&self) -> anyhow::Result<RunOutput> {
        self.run(&["merge", "--abort"])
    }

    /// Full SHA of HEAD.
    pub fn rev_parse_head(&self) -> anyhow::Result<String> {
        let out = self.run_checked(&["rev-parse", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    /// `git worktree add -b <branch> <path> <base>`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, branch: &str, path: &Path, base: &str) -> anyhow::Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "-b", branch, &path_str, base])?;
        Ok(())
    }

    /// Raw `git worktree list --porcelain` output.
    pub fn worktree_list_porcelain(&self) -> anyhow::Result<String> {
        let out = self.run_checked(&["worktree", "list", "--porcelain"])?;
        Ok(out.stdout)
    }

    #[instrument(skip_all, fields(path = %path.display(), force))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> anyhow::Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> anyhow::Result<RunOutput> {
        self.tool(args).run_ok()
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<RunOutput> {
        self.tool(args).run()
    }

    fn tool(&self, args: &[&str]) -> Tool {
        Tool::new("git").args(args).current_dir(&self.workdir)
    }
}

/// Locate the repository root containing `start`.
pub fn find_repo_root(start: &Path) -> anyhow::Result<PathBuf> {
    let out = Tool::new("git")
        .args(&["rev-parse", "--show-toplevel"])
        .current_dir(start)
        .run_ok()
        .with_context(|| format!("{} is not inside a git repository", start.display()))?;
    Ok(PathBuf::from(out.stdout.trim()))
}
