use std::path::PathBuf;

use clap::Subcommand;

use super::OutputFormat;
use crate::router::Context;
use crate::worktree::WorktreeManager;

#[derive(Debug, Subcommand)]
pub enum WorktreeCommand {
    /// List git worktrees
    List {
        /// Output format
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Create the worktree for a (role, task) pair
    Create {
        role: String,
        task: String,
        /// Branch to fork from (defaults to the trunk branch)
        #[arg(long)]
        base: Option<String>,
    },
    /// Remove a worktree
    Remove {
        path: PathBuf,
        /// Discard uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// Prune stale worktree metadata
    Prune,
}

impl WorktreeCommand {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Create { .. } => "create",
            Self::Remove { .. } => "remove",
            Self::Prune => "prune",
        }
    }

    pub fn execute(&self, ctx: &Context) -> anyhow::Result<()> {
        let config = &ctx.config;
        let mgr = WorktreeManager::new(&ctx.repo_root, config.worktree_base(&ctx.repo_root));
        match self {
            Self::List { format } => {
                let worktrees = mgr.list()?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&worktrees)?);
                    }
                    OutputFormat::Text => {
                        for wt in &worktrees {
                            let branch = if wt.is_bare {
                                "(bare)"
                            } else if wt.branch.is_empty() {
                                "(detached)"
                            } else {
                                wt.branch.as_str()
                            };
                            let sha = wt.head_sha.get(..8).unwrap_or(wt.head_sha.as_str());
                            println!("{}  {sha:<8}  {branch}", wt.path.display());
                        }
                    }
                }
            }
            Self::Create { role, task, base } => {
                let base = base.as_deref().unwrap_or(&config.project.trunk_branch);
                let wt = mgr.create(role, task, base, &config.worktrees.branch_prefix)?;
                println!("Created {} on {}", wt.path.display(), wt.branch);
            }
            Self::Remove { path, force } => {
                mgr.remove(path, *force)?;
                println!("Removed {}", path.display());
            }
            Self::Prune => {
                mgr.prune()?;
                println!("Pruned worktree metadata");
            }
        }
        Ok(())
    }
}
