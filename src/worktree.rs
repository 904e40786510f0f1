//! Worktree lifecycle: one git worktree per (role, task), each on its own branch.
//!
//! Both the branch name and the path are derived from the (role, task) key, so
//! any component can find a task's worktree without a lookup table.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use crate::git::Git;

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worktree {
    pub path: PathBuf,
    /// Short branch name; empty for a detached HEAD.
    pub branch: String,
    pub head_sha: String,
    pub is_bare: bool,
}

/// Parse porcelain worktree output into records.
///
/// Blocks are separated by blank lines; leading/trailing blank lines and a
/// final block without a terminator are accepted. Blocks without a
/// `worktree` line are ignored.
pub fn parse_porcelain(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut current: Option<Worktree> = None;

    for line in output.lines().map(str::trim_end) {
        if line.is_empty() {
            worktrees.extend(current.take());
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        match key {
            "worktree" => {
                worktrees.extend(current.take());
                current = Some(Worktree {
                    path: PathBuf::from(value),
                    branch: String::new(),
                    head_sha: String::new(),
                    is_bare: false,
                });
            }
            "HEAD" => {
                if let Some(wt) = current.as_mut() {
                    wt.head_sha = value.to_string();
                }
            }
            "branch" => {
                if let Some(wt) = current.as_mut() {
                    wt.branch = value.strip_prefix("refs/heads/").unwrap_or(value).to_string();
                }
            }
            "bare" => {
                if let Some(wt) = current.as_mut() {
                    wt.is_bare = true;
                }
            }
            _ => {}
        }
    }
    worktrees.extend(current);
    worktrees
}

/// Manages agent worktrees under a base directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: Git,
    base: PathBuf,
}

impl WorktreeManager {
    /// `base` defaults to `<repo parent>/<repo name>.worktrees`.
    pub fn new(repo_root: &Path, base: Option<PathBuf>) -> Self {
        let base = base.unwrap_or_else(|| default_base(repo_root));
        Self {
            git: Git::new(repo_root),
            base,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn branch_name(prefix: &str, role: &str, task: &str) -> String {
        format!("{prefix}/{role}/{task}")
    }

    pub fn path_for(&self, role: &str, task: &str) -> PathBuf {
        self.base.join(role).join(task)
    }

    pub fn list(&self) -> anyhow::Result<Vec<Worktree>> {
        let output = self.git.worktree_list_porcelain()?;
        Ok(parse_porcelain(&output))
    }

    /// Create a worktree on a new branch forked from `base_branch`.
    ///
    /// Fails with the git error when the branch or path already exists.
    pub fn create(
        &self,
        role: &str,
        task: &str,
        base_branch: &str,
        prefix: &str,
    ) -> anyhow::Result<Worktree> {
        let branch = Self::branch_name(prefix, role, task);
        let path = self.path_for(role, task);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        self.git.worktree_add(&branch, &path, base_branch)?;
        let head_sha = Git::new(&path).rev_parse_head()?;
        info!(branch = %branch, path = %path.display(), "created worktree");

        Ok(Worktree {
            path,
            branch,
            head_sha,
            is_bare: false,
        })
    }

    /// Remove a worktree. `force` discards uncommitted changes left by a crashed agent.
    pub fn remove(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        self.git.worktree_remove(path, force)?;
        info!(path = %path.display(), force, "removed worktree");
        Ok(())
    }

    pub fn prune(&self) -> anyhow::Result<()> {
        self.git.worktree_prune()
    }

    /// Path check only; does not consult git.
    pub fn exists(&self, role: &str, task: &str) -> bool {
        self.path_for(role, task).exists()
    }

    pub fn find_by_branch(&self, branch: &str) -> anyhow::Result<Option<Worktree>> {
        let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        Ok(self.list()?.into_iter().find(|wt| wt.branch == branch))
    }
}

fn default_base(repo_root: &Path) -> PathBuf {
    let name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let parent = repo_root.parent().unwrap_or(repo_root);
    parent.join(format!("{name}.worktrees"))
}
